use std::collections::HashMap;

use relay_bus::ChannelFilter;

use crate::capability::Topic;
use crate::identifier::Identifier;

/// Exact-name table from `<identifier>_<topic>` to a capability topic,
/// fixed at session construction.
#[derive(Debug, Clone)]
pub struct ChannelRouter<T: Topic> {
    routes: HashMap<String, T>,
}

impl<T: Topic> ChannelRouter<T> {
    pub fn new(identifier: &Identifier) -> Self {
        let routes = T::ALL
            .iter()
            .map(|topic| (identifier.channel(topic.as_str()), *topic))
            .collect();
        Self { routes }
    }

    /// Unmapped channels resolve to `None` and are dropped by the caller.
    pub fn resolve(&self, channel: &str) -> Option<T> {
        self.routes.get(channel).copied()
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn filters(&self) -> Vec<ChannelFilter> {
        let mut names: Vec<&str> = self.channels().collect();
        names.sort_unstable();
        names
            .into_iter()
            .map(|name| ChannelFilter::Exact(name.to_string()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
