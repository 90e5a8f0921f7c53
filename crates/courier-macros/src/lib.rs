//! Procedural macros for the Courier message bus.
//!
//! This crate provides:
//!
//! - `#[derive(Message)]` - Implements `courier_core::Message` with a static
//!   type descriptor and parent-aware views
//!
//! # Message Derive Macro
//!
//! ```rust,ignore
//! use courier_macros::Message;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, Message)]
//! #[message(kind = "event")]
//! pub struct OrderEvent {
//!     pub order_id: String,
//! }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, Message)]
//! pub struct OrderShipped {
//!     #[message(parent)]
//!     pub order: OrderEvent,
//!     pub carrier: String,
//! }
//! ```

mod message;

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

/// Derives `courier_core::Message` for a struct.
///
/// # Struct Attributes
///
/// - `#[message(kind = "command" | "query" | "event")]` - Base kind, required
///   unless a parent field is marked
/// - `#[message(name = "...")]` - Override the fully-qualified type name
///
/// # Field Attributes
///
/// - `#[message(parent)]` - Marks the embedded parent message. The derived
///   type then descends from the parent's type and can be viewed as it.
///   `Deref` to the parent is generated. The parent needs no
///   `#[serde(flatten)]`: broker entities of an ancestor type carry the
///   ancestor's own layout.
#[proc_macro_derive(Message, attributes(message))]
pub fn derive_message(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    message::derive_message(&input)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}
