pub mod whatsapp;

pub use whatsapp::{GatewayError, MessagingGateway, WhatsAppApiService};

#[cfg(test)]
pub use whatsapp::MockMessagingGateway;
