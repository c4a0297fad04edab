//! Effects the runtime needs from the page it runs in.
//!
//! A browser build implements [`ClientHost`] over the DOM; `hotwire connect`
//! implements it natively over HTTP. Tests use an in-memory fake.

use crate::error::Result;
use async_trait::async_trait;
use hotwire_proto::ErrorPayload;
use serde_json::Value;
use std::time::Duration;

/// Opaque handle to a stylesheet `<link>` element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub u64);

/// A stylesheet link currently in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkElement {
    pub id: ElementId,
    pub href: String,
}

#[async_trait]
pub trait ClientHost: Send + Sync {
    /// Dynamically import a module. Resolves to its namespace.
    async fn import_module(&self, url: &str) -> Result<Value>;

    /// Reload the whole page.
    fn reload(&self);

    /// Path of the current page, URI-decoded.
    fn location_pathname(&self) -> String;

    /// Stylesheet links in document order.
    fn link_elements(&self) -> Vec<LinkElement>;

    /// Insert a clone of `existing` pointing at `href` right after it.
    /// Resolves once the clone has loaded or failed to load.
    async fn insert_link_after(&self, existing: ElementId, href: &str) -> ElementId;

    fn remove_element(&self, id: ElementId);

    fn is_document_hidden(&self) -> bool;

    /// Resolves on the next visibility change to visible.
    async fn wait_until_visible(&self);

    async fn sleep(&self, duration: Duration);

    /// `no-cors` liveness probe. `true` once the server answers.
    async fn ping(&self, url: &str) -> bool;

    fn show_error_overlay(&self, err: &ErrorPayload);

    fn clear_error_overlay(&self);

    fn has_error_overlay(&self) -> bool;
}
