use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

use crate::services::subscription::{Messenger, MessengerError};

#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("Telegram request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Telegram API error {code}: {description}")]
    Api { code: i64, description: String },
    #[error("malformed Telegram response: {0}")]
    Malformed(String),
}

impl TelegramError {
    /// 403: the user blocked the bot or the bot lacks rights in the chat.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, TelegramError::Api { code: 403, .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl InlineKeyboardButton {
    pub fn callback(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self { text: text.into(), callback_data: Some(data.into()), url: None }
    }

    pub fn link(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self { text: text.into(), callback_data: None, url: Some(url.into()) }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyboardButton {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ReplyMarkup {
    Inline {
        inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
    },
    Keyboard {
        keyboard: Vec<Vec<KeyboardButton>>,
        resize_keyboard: bool,
        one_time_keyboard: bool,
    },
    Remove {
        remove_keyboard: bool,
    },
}

impl ReplyMarkup {
    pub fn inline(rows: Vec<Vec<InlineKeyboardButton>>) -> Self {
        ReplyMarkup::Inline { inline_keyboard: rows }
    }

    pub fn one_time_keyboard(labels: impl IntoIterator<Item = String>) -> Self {
        ReplyMarkup::Keyboard {
            keyboard: labels.into_iter().map(|text| vec![KeyboardButton { text }]).collect(),
            resize_keyboard: true,
            one_time_keyboard: true,
        }
    }

    pub fn remove() -> Self {
        ReplyMarkup::Remove { remove_keyboard: true }
    }
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<&'a ReplyMarkup>,
    disable_web_page_preview: bool,
}

#[derive(Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
    #[serde(default)]
    pub my_chat_member: Option<ChatMemberUpdated>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMember {
    pub status: String,
    pub user: TelegramUser,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMemberUpdated {
    pub chat: Chat,
    pub from: TelegramUser,
    pub new_chat_member: ChatMember,
}

#[derive(Deserialize)]
struct BotIdentity {
    id: i64,
}

#[derive(Deserialize)]
struct ChatInviteLink {
    invite_link: String,
}

fn parse_response<T: DeserializeOwned>(method: &str, body: &str) -> Result<T, TelegramError> {
    let response: TelegramResponse<T> = serde_json::from_str(body)
        .map_err(|e| TelegramError::Malformed(format!("failed to parse response: {}", e)))?;

    if response.ok {
        response
            .result
            .ok_or_else(|| TelegramError::Malformed(format!("no result in {} response", method)))
    } else {
        Err(TelegramError::Api {
            code: response.error_code.unwrap_or_default(),
            description: response.description.unwrap_or_default(),
        })
    }
}

pub struct TelegramBot {
    client: Client,
    group_chat_id: i64,
    api_url: String,
}

impl TelegramBot {
    pub fn new(bot_token: &str, group_chat_id: i64, timeout: Duration) -> Result<Self, TelegramError> {
        let api_url = format!("https://api.telegram.org/bot{}", bot_token);
        let client = Client::builder().timeout(timeout).build()?;
        Ok(TelegramBot { client, group_chat_id, api_url })
    }

    pub fn group_chat_id(&self) -> i64 {
        self.group_chat_id
    }

    async fn call<P: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
        timeout: Option<Duration>,
    ) -> Result<T, TelegramError> {
        let url = format!("{}/{}", self.api_url, method);
        let mut request = self.client.post(&url).json(params);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response_text = request.send().await?.text().await?;
        parse_response(method, &response_text)
    }

    /// Long-polls for updates after `offset`.
    pub async fn get_updates(&self, offset: i64, poll_timeout_secs: u64) -> Result<Vec<Update>, TelegramError> {
        let params = serde_json::json!({
            "offset": offset,
            "timeout": poll_timeout_secs,
            "allowed_updates": ["message", "callback_query", "my_chat_member"],
        });
        // the HTTP timeout has to outlast the long poll
        self.call("getUpdates", &params, Some(Duration::from_secs(poll_timeout_secs + 10)))
            .await
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_markup: Option<&ReplyMarkup>,
    ) -> Result<i64, TelegramError> {
        let request = SendMessageRequest {
            chat_id,
            text,
            parse_mode: Some("HTML"),
            reply_markup,
            disable_web_page_preview: true,
        };
        let message: Message = self.call("sendMessage", &request, None).await?;
        Ok(message.message_id)
    }

    pub async fn answer_callback_query(&self, callback_query_id: &str) -> Result<(), TelegramError> {
        let params = serde_json::json!({ "callback_query_id": callback_query_id });
        let _: bool = self.call("answerCallbackQuery", &params, None).await?;
        Ok(())
    }

    /// Single-use invite link to the community group.
    pub async fn create_invite_link(&self, user_id: i64) -> Result<String, TelegramError> {
        let params = serde_json::json!({
            "chat_id": self.group_chat_id,
            "name": format!("user {}", user_id),
            "member_limit": 1,
        });
        let link: ChatInviteLink = self.call("createChatInviteLink", &params, None).await?;
        Ok(link.invite_link)
    }

    /// Removes the user from the group without a lasting ban, so they can
    /// rejoin after paying again.
    pub async fn kick_from_group(&self, user_id: i64) -> Result<(), TelegramError> {
        let ban = serde_json::json!({ "chat_id": self.group_chat_id, "user_id": user_id });
        let _: bool = self.call("banChatMember", &ban, None).await?;
        let unban = serde_json::json!({
            "chat_id": self.group_chat_id,
            "user_id": user_id,
            "only_if_banned": true,
        });
        let _: bool = self.call("unbanChatMember", &unban, None).await?;
        Ok(())
    }

    /// Whether the bot can manage the group (administrator or creator).
    pub async fn is_group_admin(&self) -> Result<bool, TelegramError> {
        let me: BotIdentity = self.call("getMe", &serde_json::json!({}), None).await?;
        let params = serde_json::json!({ "chat_id": self.group_chat_id, "user_id": me.id });
        let member: ChatMember = self.call("getChatMember", &params, None).await?;
        Ok(matches!(member.status.as_str(), "administrator" | "creator"))
    }
}

#[async_trait]
impl Messenger for TelegramBot {
    async fn notify(&self, user_id: i64, text: &str) -> Result<(), MessengerError> {
        self.send_message(user_id, text, None)
            .await
            .map(|_| ())
            .map_err(|e| MessengerError(e.to_string()))
    }

    async fn remove_from_group(&self, user_id: i64) -> Result<(), MessengerError> {
        self.kick_from_group(user_id)
            .await
            .map_err(|e| MessengerError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_reply_markups() {
        let inline = ReplyMarkup::inline(vec![vec![
            InlineKeyboardButton::callback("1 month - 70$", "tariff:1month"),
            InlineKeyboardButton::link("Pay", "https://t.me/CryptoBot?start=IV1"),
        ]]);
        assert_eq!(
            serde_json::to_value(&inline).unwrap(),
            serde_json::json!({"inline_keyboard": [[
                {"text": "1 month - 70$", "callback_data": "tariff:1month"},
                {"text": "Pay", "url": "https://t.me/CryptoBot?start=IV1"}
            ]]})
        );

        let keyboard = ReplyMarkup::one_time_keyboard(vec!["Binance".to_string()]);
        assert_eq!(
            serde_json::to_value(&keyboard).unwrap(),
            serde_json::json!({"keyboard": [[{"text": "Binance"}]], "resize_keyboard": true, "one_time_keyboard": true})
        );

        assert_eq!(
            serde_json::to_value(ReplyMarkup::remove()).unwrap(),
            serde_json::json!({"remove_keyboard": true})
        );
    }

    #[test]
    fn parses_updates() {
        let raw = r#"[
            {"update_id": 10, "message": {"message_id": 1, "chat": {"id": 42, "type": "private"},
                "from": {"id": 42, "is_bot": false, "first_name": "A", "username": "alice", "language_code": "ru"},
                "text": "/start"}},
            {"update_id": 11, "callback_query": {"id": "cb1", "from": {"id": 42, "is_bot": false, "first_name": "A"},
                "chat_instance": "x", "data": "tariff:1month"}},
            {"update_id": 12, "my_chat_member": {"chat": {"id": 42, "type": "private"},
                "from": {"id": 42, "is_bot": false, "first_name": "A"}, "date": 0,
                "old_chat_member": {"status": "member", "user": {"id": 1, "is_bot": true, "first_name": "bot"}},
                "new_chat_member": {"status": "kicked", "user": {"id": 1, "is_bot": true, "first_name": "bot"}}}}
        ]"#;
        let updates: Vec<Update> = serde_json::from_str(raw).unwrap();
        assert_eq!(updates.len(), 3);
        let message = updates[0].message.as_ref().unwrap();
        assert_eq!(message.text.as_deref(), Some("/start"));
        assert_eq!(message.from.as_ref().unwrap().language_code.as_deref(), Some("ru"));
        assert_eq!(updates[1].callback_query.as_ref().unwrap().data.as_deref(), Some("tariff:1month"));
        assert_eq!(updates[2].my_chat_member.as_ref().unwrap().new_chat_member.status, "kicked");
    }

    #[test]
    fn unwraps_response_envelopes() {
        let sent: Message = parse_response(
            "sendMessage",
            r#"{"ok":true,"result":{"message_id":77,"chat":{"id":42,"type":"private"},"date":0,"text":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(sent.message_id, 77);

        let banned: bool = parse_response("banChatMember", r#"{"ok":true,"result":true}"#).unwrap();
        assert!(banned);

        let missing: Result<Message, _> = parse_response("sendMessage", r#"{"ok":true}"#);
        assert!(matches!(missing, Err(TelegramError::Malformed(_))));

        let blocked: Result<Message, _> = parse_response(
            "sendMessage",
            r#"{"ok":false,"error_code":403,"description":"Forbidden: bot was blocked by the user"}"#,
        );
        assert!(blocked.unwrap_err().is_forbidden());
    }

    #[test]
    fn classifies_forbidden_errors() {
        let blocked = TelegramError::Api { code: 403, description: "Forbidden: bot was blocked by the user".into() };
        assert!(blocked.is_forbidden());
        let other = TelegramError::Api { code: 400, description: "Bad Request".into() };
        assert!(!other.is_forbidden());
    }
}
