//! Thin delivery sinks. Transport and rendering stay minimal here — these
//! implement the [`watch_runtime::sink::Sink`] contract, nothing more.

mod json;
mod terminal;
mod webhook;

pub use json::JsonSink;
pub use terminal::TerminalSink;
pub use webhook::WebhookSink;
