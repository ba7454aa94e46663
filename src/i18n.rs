use chrono::{DateTime, Utc};
use std::borrow::Cow;

use crate::models::{Exchange, SubscriptionClass, Tariff, User};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Locale {
    En,
    Ru,
}

impl Locale {
    pub fn from_code(code: &str) -> Option<Locale> {
        let code = code.trim().to_ascii_lowercase();
        if code == "ru" || code.starts_with("ru-") || code.starts_with("ru_") {
            Some(Locale::Ru)
        } else if code == "en" || code.starts_with("en-") || code.starts_with("en_") {
            Some(Locale::En)
        } else {
            None
        }
    }
}

/// Picks the locale from the Telegram `language_code`, falling back to the bot default.
pub fn detect_locale(language_code: Option<&str>, fallback: Locale) -> Locale {
    language_code.and_then(Locale::from_code).unwrap_or(fallback)
}

pub fn format_date(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub fn welcome(locale: Locale) -> &'static str {
    match locale {
        Locale::Ru => "👋 Добро пожаловать! Выберите тип подписки:",
        Locale::En => "👋 Welcome! Choose your subscription type:",
    }
}

pub fn subscription_lapsed(locale: Locale) -> &'static str {
    match locale {
        Locale::Ru => "❗️ Ваша подписка истекла. Выберите тип подписки, чтобы продлить её:",
        Locale::En => "❗️ Your subscription has expired. Choose a subscription type to renew:",
    }
}

pub fn subscription_active(locale: Locale, until: DateTime<Utc>) -> String {
    match locale {
        Locale::Ru => format!("✅ Ваша подписка активна до <b>{}</b>", format_date(until)),
        Locale::En => format!("✅ Your subscription is active until <b>{}</b>", format_date(until)),
    }
}

/// Summary for /status: subscription state, class and saved exchange.
pub fn status_summary(locale: Locale, user: &User, now: DateTime<Utc>) -> String {
    let subscription = match user.subscription_end {
        Some(until) if user.is_active(now) => subscription_active(locale, until),
        Some(_) => match locale {
            Locale::Ru => "❌ Подписка истекла".to_string(),
            Locale::En => "❌ Subscription expired".to_string(),
        },
        None => match locale {
            Locale::Ru => "❌ Подписки нет".to_string(),
            Locale::En => "❌ No subscription".to_string(),
        },
    };
    let class = class_label(locale, user.pricing_class());
    let exchange = user.exchange().map(|e| e.as_str()).unwrap_or("-");
    match locale {
        Locale::Ru => format!("{}\nТип подписки: {}\nБиржа: {}", subscription, class, exchange),
        Locale::En => format!("{}\nSubscription type: {}\nExchange: {}", subscription, class, exchange),
    }
}

pub fn class_label(locale: Locale, class: SubscriptionClass) -> &'static str {
    match (locale, class) {
        (Locale::Ru, SubscriptionClass::Regular) => "Обычная",
        (Locale::Ru, SubscriptionClass::Referral) => "Реферальная",
        (Locale::En, SubscriptionClass::Regular) => "Regular",
        (Locale::En, SubscriptionClass::Referral) => "Referral",
    }
}

pub fn choose_tariff(locale: Locale) -> &'static str {
    match locale {
        Locale::Ru => "Выберите тариф:",
        Locale::En => "Choose a tariff:",
    }
}

pub fn tariff_name(locale: Locale, tariff: &Tariff) -> Cow<'static, str> {
    match (locale, tariff.id) {
        (Locale::Ru, "test") => Cow::Borrowed("Тестовый (1 день)"),
        (Locale::Ru, "1month") => Cow::Borrowed("1 месяц"),
        (Locale::Ru, "3months") => Cow::Borrowed("3 месяца"),
        (Locale::Ru, "6months") => Cow::Borrowed("6 месяцев"),
        (Locale::Ru, "12months") => Cow::Borrowed("12 месяцев"),
        _ => Cow::Borrowed(tariff.name),
    }
}

pub fn tariff_button(locale: Locale, tariff: &Tariff) -> String {
    format!("{} - {}$", tariff_name(locale, tariff), tariff.price)
}

pub fn invoice_created(locale: Locale, tariff: &Tariff, asset: &str) -> String {
    match locale {
        Locale::Ru => format!(
            "💳 Счёт на оплату тарифа «{}»: {} {}.\n\nПосле оплаты нажмите «Проверить оплату».",
            tariff_name(locale, tariff),
            tariff.price,
            asset
        ),
        Locale::En => format!(
            "💳 Invoice for the \"{}\" tariff: {} {}.\n\nAfter paying, press \"Check payment\".",
            tariff_name(locale, tariff),
            tariff.price,
            asset
        ),
    }
}

pub fn pay_button(locale: Locale) -> &'static str {
    match locale {
        Locale::Ru => "Оплатить",
        Locale::En => "Pay",
    }
}

pub fn check_payment_button(locale: Locale) -> &'static str {
    match locale {
        Locale::Ru => "Проверить оплату",
        Locale::En => "Check payment",
    }
}

pub fn payment_confirmed(locale: Locale, until: DateTime<Utc>) -> String {
    match locale {
        Locale::Ru => format!("🎉 Оплата получена! Подписка активна до <b>{}</b>", format_date(until)),
        Locale::En => format!("🎉 Payment received! Your subscription is active until <b>{}</b>", format_date(until)),
    }
}

pub fn invite_link(locale: Locale, link: &str) -> String {
    match locale {
        Locale::Ru => format!("🔗 Ваша ссылка для входа в группу: {}", link),
        Locale::En => format!("🔗 Your link to join the group: {}", link),
    }
}

pub fn payment_pending(locale: Locale) -> &'static str {
    match locale {
        Locale::Ru => "⏳ Оплата пока не поступила. Попробуйте проверить чуть позже.",
        Locale::En => "⏳ Payment has not arrived yet. Please check again a bit later.",
    }
}

pub fn no_payment(locale: Locale) -> &'static str {
    match locale {
        Locale::Ru => "У вас нет выставленных счетов. Выберите тариф через /start.",
        Locale::En => "You have no invoices yet. Pick a tariff via /start.",
    }
}

pub fn invalid_tariff(locale: Locale) -> &'static str {
    match locale {
        Locale::Ru => "Такого тарифа нет. Выберите тариф из списка.",
        Locale::En => "No such tariff. Please pick one from the list.",
    }
}

pub fn class_locked(locale: Locale) -> &'static str {
    match locale {
        Locale::Ru => "Тип подписки нельзя сменить, пока подписка активна.",
        Locale::En => "The subscription type can't be changed while the subscription is active.",
    }
}

pub fn choose_exchange(locale: Locale) -> &'static str {
    match locale {
        Locale::Ru => "Выберите биржу для получения торговых сигналов:",
        Locale::En => "Choose the exchange you want trading signals for:",
    }
}

pub fn unsupported_exchange(locale: Locale) -> &'static str {
    match locale {
        Locale::Ru => "Пожалуйста, выберите биржу из предложенного списка.",
        Locale::En => "Please choose an exchange from the list.",
    }
}

pub fn request_api_key(locale: Locale) -> &'static str {
    match locale {
        Locale::Ru => "Пожалуйста, предоставьте API-ключ для выбранной биржи.\n\n\
            🔒 <b>О безопасности:</b>\n\
            1. Мы используем ваш API-ключ только для чтения данных (баланс, история сделок).\n\
            2. Ключ надежно хранится и не передается третьим лицам.\n\
            3. Убедитесь, что ключ настроен только на чтение (без прав на торговлю и вывод).\n\n\
            Введите API-ключ:",
        Locale::En => "Please send the API key for the chosen exchange.\n\n\
            🔒 <b>About security:</b>\n\
            1. We only use your API key to read data (balance, trade history).\n\
            2. The key is stored securely and never shared with third parties.\n\
            3. Make sure the key is read-only (no trading or withdrawal permissions).\n\n\
            Enter your API key:",
    }
}

pub fn empty_api_key(locale: Locale) -> &'static str {
    match locale {
        Locale::Ru => "API-ключ не может быть пустым. Введите API-ключ:",
        Locale::En => "The API key can't be empty. Enter your API key:",
    }
}

pub fn exchange_saved(locale: Locale, exchange: Exchange) -> String {
    match locale {
        Locale::Ru => format!("✅ Биржа ({}) и API-ключ успешно сохранены!", exchange),
        Locale::En => format!("✅ Exchange ({}) and API key saved!", exchange),
    }
}

pub fn exchange_already_set(locale: Locale) -> &'static str {
    match locale {
        Locale::Ru => "Биржа уже сохранена. Чтобы изменить её, используйте /exchange.",
        Locale::En => "An exchange is already saved. Use /exchange to change it.",
    }
}

pub fn exchange_needs_subscription(locale: Locale) -> &'static str {
    match locale {
        Locale::Ru => "Сначала оформите подписку через /start.",
        Locale::En => "Subscribe first via /start.",
    }
}

pub fn help(locale: Locale, support_url: &str) -> String {
    match locale {
        Locale::Ru => format!(
            "Если у вас возникли вопросы, обратитесь в техническую поддержку: {}",
            support_url
        ),
        Locale::En => format!("If you have any questions, contact support: {}", support_url),
    }
}

pub fn try_later(locale: Locale) -> &'static str {
    match locale {
        Locale::Ru => "Платёжный сервис временно недоступен. Попробуйте позже.",
        Locale::En => "The payment service is temporarily unavailable. Please try again later.",
    }
}

pub fn contact_support(locale: Locale, support_url: &str) -> String {
    match locale {
        Locale::Ru => format!(
            "⚠️ Не удалось завершить обработку платежа. Пожалуйста, свяжитесь с поддержкой: {}",
            support_url
        ),
        Locale::En => format!(
            "⚠️ We couldn't finish processing your payment. Please contact support: {}",
            support_url
        ),
    }
}

pub fn generic_failure(locale: Locale) -> &'static str {
    match locale {
        Locale::Ru => "Произошла ошибка. Попробуйте ещё раз.",
        Locale::En => "Something went wrong. Please try again.",
    }
}

pub fn subscription_expired_notice(locale: Locale) -> &'static str {
    match locale {
        Locale::Ru => "⌛️ Ваша подписка закончилась, доступ к группе закрыт. Чтобы продлить подписку, нажмите /start.",
        Locale::En => "⌛️ Your subscription has ended and group access was revoked. Press /start to renew.",
    }
}
