pub mod processor;
pub mod telegram;

pub use processor::NotificationProcessor;
pub use telegram::TelegramClient;
