// Event dispatch
//
// Glue between the normalizer and everything downstream: status updates go
// to the reconciler, template updates to the template store, inbound
// messages through conversation upsert and into the automation engine.

pub mod dispatcher;
pub mod reconciler;

pub use dispatcher::Dispatcher;
pub use reconciler::{campaign_delta, StatusReconciler};
