pub mod chat;
pub mod push;

pub use chat::{ChatError, ChatGateway, LogChatGateway, WebhookChatGateway};
pub use push::{
    DeliveryReceipt, FcmPushGateway, LogPushGateway, PushError, PushGateway, PushMessage,
    ServiceAccountKey,
};
