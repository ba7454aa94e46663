use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::i18n::{self, Locale};
use crate::models::{Exchange, SubscriptionClass, TariffCatalog, User};
use crate::services::subscription::{EngineError, ErrorKind, InvoiceTicket, PaymentOutcome};
use crate::services::telegram::{CallbackQuery, InlineKeyboardButton, Message, ReplyMarkup, Update};
use crate::state::{AppState, Session};

const POLL_TIMEOUT_SECS: u64 = 30;
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);
const WORKER_IDLE: Duration = Duration::from_secs(600);
const WORKER_QUEUE: usize = 32;

#[derive(Debug, Clone)]
pub struct Reply {
    pub text: String,
    pub markup: Option<ReplyMarkup>,
}

impl Reply {
    fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), markup: None }
    }

    fn with_markup(text: impl Into<String>, markup: ReplyMarkup) -> Self {
        Self { text: text.into(), markup: Some(markup) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Status,
    Exchange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    SelectClass(SubscriptionClass),
    SelectTariff(String),
    CheckPayment(Option<String>),
}

/// Recognises `/command` and `/command@botname`, ignoring arguments.
pub fn parse_command(text: &str) -> Option<Command> {
    let word = text.trim().split_whitespace().next()?;
    let name = word.strip_prefix('/')?.split('@').next()?;
    match name.to_ascii_lowercase().as_str() {
        "start" => Some(Command::Start),
        "help" => Some(Command::Help),
        "status" => Some(Command::Status),
        "exchange" => Some(Command::Exchange),
        _ => None,
    }
}

pub fn parse_callback(data: &str) -> Option<CallbackAction> {
    let (action, arg) = match data.split_once(':') {
        Some((action, arg)) => (action, Some(arg)),
        None => (data, None),
    };
    match (action, arg) {
        ("class", Some(class)) => class.parse().ok().map(CallbackAction::SelectClass),
        ("tariff", Some(id)) if !id.is_empty() => Some(CallbackAction::SelectTariff(id.to_string())),
        ("check_payment", hint) => Some(CallbackAction::CheckPayment(
            hint.filter(|h| !h.is_empty()).map(str::to_string),
        )),
        _ => None,
    }
}

pub fn class_keyboard(locale: Locale) -> ReplyMarkup {
    ReplyMarkup::inline(
        [SubscriptionClass::Regular, SubscriptionClass::Referral]
            .into_iter()
            .map(|class| {
                vec![InlineKeyboardButton::callback(
                    i18n::class_label(locale, class),
                    format!("class:{}", class),
                )]
            })
            .collect(),
    )
}

pub fn tariff_keyboard(locale: Locale, catalog: &TariffCatalog, class: SubscriptionClass) -> ReplyMarkup {
    ReplyMarkup::inline(
        catalog
            .tariffs(class)
            .iter()
            .map(|tariff| {
                vec![InlineKeyboardButton::callback(
                    i18n::tariff_button(locale, tariff),
                    format!("tariff:{}", tariff.id),
                )]
            })
            .collect(),
    )
}

pub fn exchange_keyboard() -> ReplyMarkup {
    ReplyMarkup::one_time_keyboard(Exchange::ALL.iter().map(|e| e.as_str().to_string()))
}

pub fn invoice_reply(locale: Locale, ticket: &InvoiceTicket) -> Reply {
    Reply::with_markup(
        i18n::invoice_created(locale, &ticket.tariff, &ticket.currency),
        ReplyMarkup::inline(vec![
            vec![InlineKeyboardButton::link(i18n::pay_button(locale), ticket.pay_url.clone())],
            vec![InlineKeyboardButton::callback(
                i18n::check_payment_button(locale),
                format!("check_payment:{}", ticket.tariff.id),
            )],
        ]),
    )
}

/// Maps an engine failure onto what the user is told.
pub fn error_reply(locale: Locale, err: &EngineError, support_url: &str) -> Reply {
    let text = match (err.kind(), err) {
        (_, EngineError::InvalidTariff(_)) => i18n::invalid_tariff(locale).to_string(),
        (_, EngineError::UnsupportedExchange(_)) => i18n::unsupported_exchange(locale).to_string(),
        (_, EngineError::EmptyApiKey) => i18n::empty_api_key(locale).to_string(),
        (_, EngineError::ExchangeAlreadySet) => i18n::exchange_already_set(locale).to_string(),
        (_, EngineError::ClassLocked) => i18n::class_locked(locale).to_string(),
        (ErrorKind::NotFound, _) => i18n::no_payment(locale).to_string(),
        (ErrorKind::Gateway, _) => i18n::try_later(locale).to_string(),
        (ErrorKind::TariffResolution, _) | (_, EngineError::ConfirmationFailed { .. }) => {
            i18n::contact_support(locale, support_url)
        }
        _ => i18n::generic_failure(locale).to_string(),
    };
    Reply::text(text)
}

fn exchange_prompt(locale: Locale) -> Reply {
    Reply::with_markup(i18n::choose_exchange(locale), exchange_keyboard())
}

/// Long-polls Telegram and hands every update to its user's worker.
pub async fn run_polling(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut offset = 0i64;
    let mut workers: HashMap<i64, mpsc::Sender<Update>> = HashMap::new();
    info!("telegram polling started");

    loop {
        let result = tokio::select! {
            result = state.telegram.get_updates(offset, POLL_TIMEOUT_SECS) => result,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match result {
            Ok(updates) => {
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    dispatch(&state, &mut workers, update);
                }
                workers.retain(|_, tx| !tx.is_closed());
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch updates");
                tokio::time::sleep(POLL_RETRY_DELAY).await;
            }
        }
    }

    info!("telegram polling stopped");
}

fn update_user_id(update: &Update) -> Option<i64> {
    if let Some(callback) = &update.callback_query {
        return Some(callback.from.id);
    }
    if let Some(message) = &update.message {
        return message.from.as_ref().map(|from| from.id);
    }
    update.my_chat_member.as_ref().map(|member| member.from.id)
}

/// Queues an update for its user's worker. Never waits: a user whose queue
/// is full loses the update instead of stalling everyone else.
fn dispatch(state: &AppState, workers: &mut HashMap<i64, mpsc::Sender<Update>>, update: Update) {
    let Some(user_id) = update_user_id(&update) else {
        debug!(update_id = update.update_id, "skipping update without a sender");
        return;
    };

    let mut update = update;
    if let Some(tx) = workers.get(&user_id) {
        match tx.try_send(update) {
            Ok(()) => return,
            Err(TrySendError::Full(dropped)) => {
                debug!(user_id, update_id = dropped.update_id, "user queue is full, dropping update");
                return;
            }
            Err(TrySendError::Closed(returned)) => update = returned,
        }
    }

    let (tx, rx) = mpsc::channel(WORKER_QUEUE);
    tokio::spawn(user_worker(state.clone(), user_id, rx, WORKER_IDLE));
    if tx.try_send(update).is_ok() {
        workers.insert(user_id, tx);
    }
}

/// Handles one user's updates in arrival order; exits after `idle` without
/// updates and drops the user's conversation state.
async fn user_worker(state: AppState, user_id: i64, mut rx: mpsc::Receiver<Update>, idle: Duration) {
    loop {
        match tokio::time::timeout(idle, rx.recv()).await {
            Ok(Some(update)) => handle_update(&state, update).await,
            Ok(None) => break,
            Err(_) => {
                rx.close();
                while let Ok(update) = rx.try_recv() {
                    handle_update(&state, update).await;
                }
                break;
            }
        }
    }
    state.sessions.clear(user_id).await;
    debug!(user_id, "user worker stopped");
}

pub async fn send_replies(state: &AppState, chat_id: i64, replies: Vec<Reply>) {
    for reply in replies {
        if let Err(e) = state
            .telegram
            .send_message(chat_id, &reply.text, reply.markup.as_ref())
            .await
        {
            if e.is_forbidden() {
                debug!(user_id = chat_id, "user blocked the bot, dropping replies");
                return;
            }
            warn!(user_id = chat_id, error = %e, "failed to send message");
        }
    }
}

async fn handle_update(state: &AppState, update: Update) {
    if let Some(member) = update.my_chat_member {
        if member.chat.kind == "private" && member.new_chat_member.status == "kicked" {
            let user_id = member.from.id;
            state.sessions.clear(user_id).await;
            if let Err(e) = state.engine.forget_user(user_id).await {
                error!(user_id, error = %e, "failed to remove user who blocked the bot");
            }
        }
        return;
    }

    if let Some(callback) = update.callback_query {
        handle_callback(state, callback).await;
        return;
    }

    if let Some(message) = update.message {
        if message.chat.kind == "private" {
            handle_message(state, message).await;
        }
    }
}

async fn handle_callback(state: &AppState, callback: CallbackQuery) {
    let user_id = callback.from.id;
    let locale = i18n::detect_locale(callback.from.language_code.as_deref(), state.config.locale);

    if let Err(e) = state.telegram.answer_callback_query(&callback.id).await {
        debug!(user_id, error = %e, "failed to answer callback query");
    }
    if let Err(e) = state.engine.touch_user(user_id, callback.from.username.as_deref()).await {
        error!(user_id, error = %e, "failed to refresh user");
        send_replies(state, user_id, vec![error_reply(locale, &e, &state.config.support_url)]).await;
        return;
    }

    let Some(action) = callback.data.as_deref().and_then(parse_callback) else {
        debug!(user_id, data = ?callback.data, "unknown callback");
        return;
    };
    info!(user_id, action = ?action, "callback received");

    let replies = match action {
        CallbackAction::SelectClass(class) => match state.engine.select_subscription_type(user_id, class).await {
            Ok(user) => vec![Reply::with_markup(
                i18n::choose_tariff(locale),
                tariff_keyboard(locale, state.engine.catalog(), user.pricing_class()),
            )],
            Err(e) => failed(state, user_id, locale, e),
        },
        CallbackAction::SelectTariff(tariff_id) => match state.engine.select_tariff(user_id, &tariff_id).await {
            Ok(ticket) => vec![invoice_reply(locale, &ticket)],
            Err(e) => failed(state, user_id, locale, e),
        },
        CallbackAction::CheckPayment(hint) => match state.engine.check_payment(user_id, hint.as_deref()).await {
            Ok(outcome) => payment_replies(state, user_id, locale, outcome).await,
            Err(e) => failed(state, user_id, locale, e),
        },
    };
    send_replies(state, user_id, replies).await;
}

fn failed(state: &AppState, user_id: i64, locale: Locale, err: EngineError) -> Vec<Reply> {
    match err.kind() {
        ErrorKind::Validation | ErrorKind::NotFound => warn!(user_id, error = %err, "request rejected"),
        _ => error!(user_id, error = %err, "request failed"),
    }
    vec![error_reply(locale, &err, &state.config.support_url)]
}

/// Replies for a reconciled payment; shared by the button and the gateway webhook.
pub async fn payment_replies(state: &AppState, user_id: i64, locale: Locale, outcome: PaymentOutcome) -> Vec<Reply> {
    match outcome {
        PaymentOutcome::NotYetPaid => vec![Reply::with_markup(
            i18n::payment_pending(locale),
            ReplyMarkup::inline(vec![vec![InlineKeyboardButton::callback(
                i18n::check_payment_button(locale),
                "check_payment",
            )]]),
        )],
        PaymentOutcome::Confirmed { expires_at, needs_exchange_setup, .. } => {
            let mut replies = vec![Reply::text(i18n::payment_confirmed(locale, expires_at))];
            match state.telegram.create_invite_link(user_id).await {
                Ok(link) => replies.push(Reply::text(i18n::invite_link(locale, &link))),
                Err(e) => error!(user_id, error = %e, "failed to create group invite link"),
            }
            if needs_exchange_setup {
                state.sessions.set(user_id, Session::AwaitingExchange).await;
                replies.push(exchange_prompt(locale));
            }
            replies
        }
        PaymentOutcome::AlreadyConfirmed { expires_at, needs_exchange_setup } => {
            let now = state.engine.now();
            let mut replies = Vec::new();
            match expires_at {
                Some(until) if until > now => {
                    replies.push(Reply::text(i18n::subscription_active(locale, until)));
                    if needs_exchange_setup {
                        state.sessions.set(user_id, Session::AwaitingExchange).await;
                        replies.push(exchange_prompt(locale));
                    }
                }
                _ => replies.push(Reply::with_markup(
                    i18n::subscription_lapsed(locale),
                    class_keyboard(locale),
                )),
            }
            replies
        }
    }
}

async fn handle_message(state: &AppState, message: Message) {
    let Some(from) = message.from else {
        return;
    };
    let user_id = from.id;
    let locale = i18n::detect_locale(from.language_code.as_deref(), state.config.locale);

    let user = match state.engine.touch_user(user_id, from.username.as_deref()).await {
        Ok(user) => user,
        Err(e) => {
            let replies = failed(state, user_id, locale, e);
            send_replies(state, user_id, replies).await;
            return;
        }
    };
    let text = message.text.unwrap_or_default();

    let replies = match parse_command(&text) {
        Some(Command::Start) => start_replies(state, &user, locale).await,
        Some(Command::Status) => status_replies(state, user_id, locale).await,
        Some(Command::Help) => vec![Reply::text(i18n::help(locale, &state.config.support_url))],
        Some(Command::Exchange) => change_exchange(state, &user, locale).await,
        None => session_input(state, user_id, locale, &text).await,
    };
    send_replies(state, user_id, replies).await;
}

async fn start_replies(state: &AppState, user: &User, locale: Locale) -> Vec<Reply> {
    let now = state.engine.now();
    match user.subscription_end {
        Some(until) if user.is_active(now) => {
            let mut replies = vec![Reply::text(i18n::subscription_active(locale, until))];
            if user.needs_exchange_setup() {
                state.sessions.set(user.user_id, Session::AwaitingExchange).await;
                replies.push(exchange_prompt(locale));
            }
            replies
        }
        Some(_) => {
            state.sessions.clear(user.user_id).await;
            vec![Reply::with_markup(i18n::subscription_lapsed(locale), class_keyboard(locale))]
        }
        None => {
            state.sessions.clear(user.user_id).await;
            vec![Reply::with_markup(i18n::welcome(locale), class_keyboard(locale))]
        }
    }
}

async fn status_replies(state: &AppState, user_id: i64, locale: Locale) -> Vec<Reply> {
    match state.engine.user(user_id).await {
        Ok(Some(user)) => vec![Reply::text(i18n::status_summary(locale, &user, state.engine.now()))],
        Ok(None) => vec![Reply::with_markup(i18n::welcome(locale), class_keyboard(locale))],
        Err(e) => failed(state, user_id, locale, e),
    }
}

async fn change_exchange(state: &AppState, user: &User, locale: Locale) -> Vec<Reply> {
    if !user.is_active(state.engine.now()) {
        return vec![Reply::text(i18n::exchange_needs_subscription(locale))];
    }
    if let Err(e) = state.engine.clear_exchange(user.user_id).await {
        return failed(state, user.user_id, locale, e);
    }
    state.sessions.set(user.user_id, Session::AwaitingExchange).await;
    vec![exchange_prompt(locale)]
}

async fn session_input(state: &AppState, user_id: i64, locale: Locale, text: &str) -> Vec<Reply> {
    match state.sessions.get(user_id).await {
        Some(Session::AwaitingExchange) => match text.parse::<Exchange>() {
            Ok(exchange) => {
                state.sessions.set(user_id, Session::AwaitingApiKey { exchange }).await;
                vec![Reply::with_markup(i18n::request_api_key(locale), ReplyMarkup::remove())]
            }
            Err(_) => vec![Reply::with_markup(i18n::unsupported_exchange(locale), exchange_keyboard())],
        },
        Some(Session::AwaitingApiKey { exchange }) => {
            match state
                .engine
                .save_exchange_and_api_key(user_id, exchange.as_str(), text)
                .await
            {
                Ok(_) => {
                    state.sessions.clear(user_id).await;
                    vec![Reply::with_markup(i18n::exchange_saved(locale, exchange), ReplyMarkup::remove())]
                }
                // keep waiting for a usable key
                Err(EngineError::EmptyApiKey) => vec![Reply::text(i18n::empty_api_key(locale))],
                Err(e) => {
                    state.sessions.clear(user_id).await;
                    failed(state, user_id, locale, e)
                }
            }
        }
        None => vec![Reply::text(i18n::help(locale, &state.config.support_url))],
    }
}
