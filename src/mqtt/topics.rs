//! Topic namespacing under a device's base topic
//!
//! Every topic the client touches is the configured base topic plus a leaf,
//! joined with exactly one `/`. The base keeps whatever internal structure it
//! was configured with; only trailing slashes are stripped. Leading slashes on
//! a leaf are stripped so absolute-looking leaves still land inside the
//! namespace.

/// Leaf for retained online/offline state announcements (also the LWT topic).
pub const STATUS_LEAF: &str = "status";

/// Leaf for operator-visible notices and handler error reports.
pub const MESSAGE_LEAF: &str = "message";

/// Leaf for the periodic heartbeat beat.
pub const HEARTBEAT_LEAF: &str = "heartbeat";

/// A device's topic namespace, normalized once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNamespace {
    base: String,
}

impl TopicNamespace {
    pub fn new(base_topic: &str) -> Self {
        Self {
            base: base_topic.trim_end_matches('/').to_string(),
        }
    }

    /// The normalized base topic (no trailing slash).
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Join a leaf under the base topic with a single separator.
    pub fn topic(&self, leaf: &str) -> String {
        format!("{}/{}", self.base, leaf.trim_start_matches('/'))
    }

    /// Topic for retained state announcements.
    pub fn status(&self) -> String {
        self.topic(STATUS_LEAF)
    }

    /// Topic for notices and error reports.
    pub fn message(&self) -> String {
        self.topic(MESSAGE_LEAF)
    }

    /// Topic for the heartbeat service.
    pub fn heartbeat(&self) -> String {
        self.topic(HEARTBEAT_LEAF)
    }
}
