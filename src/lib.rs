//! # Tether
//!
//! Remote browser driver over the Chrome DevTools Protocol.
//!
//! Tether opens a single duplex connection to a running browser's
//! debugging endpoint, correlates commands with their asynchronous
//! replies, and reconstructs the browser's live object graph (attached
//! targets, page frame trees, scripting contexts, in-flight document
//! loads) purely from the event stream. It is the foundation layer for
//! higher-level automation; launching the browser process is the
//! caller's job.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether::{Connection, DriverConfig};
//!
//! #[tokio::main]
//! async fn main() -> tether::Result<()> {
//!     // A browser must already be running with a debugging port open
//!     let conn = Connection::new(DriverConfig::default());
//!     conn.connect("127.0.0.1:9222").await?;
//!
//!     let page = conn.new_tab("https://example.com").await?;
//!     page.wait_until_loaded().await?;
//!
//!     let title = page.evaluate("document.title", &[]).await?;
//!     println!("title: {}", title);
//!
//!     conn.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Request interception
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether::{Connection, InterceptDecision};
//!
//! # async fn example(conn: &Connection) -> tether::Result<()> {
//! conn.intercept_requests(Some("block-images"), Arc::new(|req| {
//!     let is_image = req.resource_type == "Image";
//!     Box::pin(async move {
//!         if is_image {
//!             InterceptDecision::Fail("BlockedByClient".to_string())
//!         } else {
//!             InterceptDecision::pass()
//!         }
//!     })
//! }));
//! # Ok(())
//! # }
//! ```

pub mod cdp;
pub mod context;
pub mod error;
pub mod events;
pub mod frame;
pub mod intercept;
pub mod page;
pub mod target;

use std::time::Duration;

// Re-exports
pub use cdp::connection::Connection;
pub use cdp::types::{TargetInfo, VersionInfo};
pub use context::{EvalArg, RemoteHandle, ScriptingContext};
pub use error::{Error, NavigationError, Result};
pub use events::{ListenerId, ProtocolEvent};
pub use frame::{Frame, FrameManager, WaitOptions};
pub use intercept::{
    InterceptDecision, InterceptedRequest, InterceptorHandler, RequestModifications, ResponseSpec,
};
pub use page::Page;
pub use target::Target;

/// Driver configuration
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Default deadline for each command's reply
    pub command_timeout: Duration,
    /// Default deadline for frame lifecycle waits
    pub navigation_timeout: Duration,
    /// Budget for a created target to complete its attach
    pub attach_timeout: Duration,
    /// Poll interval while waiting for an attach
    pub attach_poll_interval: Duration,
    /// Resolve lifecycle waits instead of rejecting on deadline expiry
    pub tolerate_navigation_timeout: bool,
    /// Do not reject lifecycle waits on HTTP error status
    pub ignore_http_errors: bool,
    /// Do not reject lifecycle waits on network-level load failure
    pub ignore_network_errors: bool,
    /// How much request post data the browser retains for events
    pub max_post_data_size: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            navigation_timeout: Duration::from_secs(30),
            attach_timeout: Duration::from_secs(1),
            attach_poll_interval: Duration::from_millis(50),
            tolerate_navigation_timeout: false,
            ignore_http_errors: false,
            ignore_network_errors: false,
            max_post_data_size: 65536,
        }
    }
}

impl DriverConfig {
    /// A config with short deadlines, useful for tests and health checks
    pub fn quick() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            navigation_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }
}
