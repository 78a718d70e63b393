// 3x-UI panel access: session-cookie REST client plus the per-panel
// session cache. Service code talks to panels exclusively through
// `XuiClient`; nothing above this module sees cookies or envelopes.

mod client;
mod error;
mod session;
pub mod types;

pub use client::XuiClient;
pub use error::PanelError;
