// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Subscription trie with wildcard matching and retained message slots.

use bytes::Bytes;
use codec::topic::{LEVEL_WILDCARD, MULTI_LEVEL_WILDCARD};
use codec::QoS;
use std::collections::HashMap;

/// A message stored at the node of its topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

/// One trie node per topic level.
///
/// The child map is only allocated once the first child appears; leaf nodes
/// stay small.
#[derive(Debug, Default)]
pub struct TopicNode {
    children: Option<HashMap<String, TopicNode>>,
    subscribers: HashMap<String, QoS>,
    retained: Option<RetainedMessage>,
}

impl TopicNode {
    fn child(&self, level: &str) -> Option<&Self> {
        self.children.as_ref().and_then(|children| children.get(level))
    }

    /// A node with no children, no subscribers and no retained message can
    /// be pruned.
    fn is_empty(&self) -> bool {
        self.children.as_ref().map_or(true, HashMap::is_empty)
            && self.subscribers.is_empty()
            && self.retained.is_none()
    }
}

/// Trie keyed by `/`-separated topic levels.
///
/// Topics whose first level starts with `$` are never matched by a wildcard
/// at level 0, so a `#` subscriber does not see `$SYS` traffic.
#[derive(Debug, Default)]
pub struct TopicTree {
    root: TopicNode,
}

impl TopicTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn descend(&mut self, topic: &str) -> &mut TopicNode {
        let mut node = &mut self.root;
        for level in topic.split('/') {
            node = node
                .children
                .get_or_insert_with(HashMap::new)
                .entry(level.to_string())
                .or_default();
        }
        node
    }

    fn find(&self, topic: &str) -> Option<&TopicNode> {
        let mut node = &self.root;
        for level in topic.split('/') {
            node = node.child(level)?;
        }
        Some(node)
    }

    /// Install a subscription, overwriting any previous grant for the same
    /// client and filter.
    pub fn subscribe(&mut self, filter: &str, client_id: &str, qos: QoS) {
        let node = self.descend(filter);
        node.subscribers.insert(client_id.to_string(), qos);
    }

    /// Remove one subscription. Nodes are not collapsed eagerly; pruning is
    /// periodic.
    pub fn unsubscribe(&mut self, filter: &str, client_id: &str) -> bool {
        let mut node = &mut self.root;
        for level in filter.split('/') {
            let Some(child) = node
                .children
                .as_mut()
                .and_then(|children| children.get_mut(level))
            else {
                return false;
            };
            node = child;
        }
        node.subscribers.remove(client_id).is_some()
    }

    /// Remove every subscription of `client_id`, wherever it lives.
    pub fn unsubscribe_all(&mut self, client_id: &str) {
        let mut stack: Vec<&mut TopicNode> = vec![&mut self.root];
        while let Some(node) = stack.pop() {
            node.subscribers.remove(client_id);
            if let Some(children) = node.children.as_mut() {
                stack.extend(children.values_mut());
            }
        }
    }

    /// Find all subscribers matching a concrete topic name.
    ///
    /// When several filters of the same client match, the highest granted
    /// QoS wins.
    #[must_use]
    pub fn match_topic(&self, topic: &str) -> HashMap<String, QoS> {
        let levels: Vec<&str> = topic.split('/').collect();
        let is_system_topic = levels[0].starts_with('$');
        let mut result = HashMap::new();

        let mut stack: Vec<(&TopicNode, usize)> = vec![(&self.root, 0)];
        while let Some((node, level_idx)) = stack.pop() {
            if level_idx == levels.len() {
                collect_grants(&mut result, &node.subscribers);
                // 'foo/#' also matches 'foo' itself.
                if let Some(child) = node.child(MULTI_LEVEL_WILDCARD) {
                    collect_grants(&mut result, &child.subscribers);
                }
                continue;
            }

            let wildcards_allowed = level_idx > 0 || !is_system_topic;

            if let Some(child) = node.child(levels[level_idx]) {
                stack.push((child, level_idx + 1));
            }
            if wildcards_allowed {
                if let Some(child) = node.child(LEVEL_WILDCARD) {
                    stack.push((child, level_idx + 1));
                }
                if let Some(child) = node.child(MULTI_LEVEL_WILDCARD) {
                    collect_grants(&mut result, &child.subscribers);
                }
            }
        }

        result
    }

    /// Store or clear the retained message of `topic`. An empty payload
    /// clears the slot.
    pub fn set_retained(&mut self, topic: &str, payload: &[u8], qos: QoS) {
        let node = self.descend(topic);
        if payload.is_empty() {
            node.retained = None;
        } else {
            node.retained = Some(RetainedMessage {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(payload),
                qos,
            });
        }
    }

    #[must_use]
    pub fn get_retained(&self, topic: &str) -> Option<&RetainedMessage> {
        self.find(topic).and_then(|node| node.retained.as_ref())
    }

    /// Collect retained messages matching a topic filter.
    #[must_use]
    pub fn retained_matching(&self, filter: &str) -> Vec<RetainedMessage> {
        let levels: Vec<&str> = filter.split('/').collect();
        let mut result = Vec::new();

        let mut stack: Vec<(&TopicNode, usize)> = vec![(&self.root, 0)];
        while let Some((node, level_idx)) = stack.pop() {
            if level_idx == levels.len() {
                if let Some(retained) = &node.retained {
                    result.push(retained.clone());
                }
                continue;
            }

            let filter_level = levels[level_idx];
            let is_first_level = level_idx == 0;

            if filter_level == MULTI_LEVEL_WILDCARD {
                // Collect every retained message below this node. A leading
                // '#' never reveals '$'-prefixed topics.
                let mut dfs: Vec<&TopicNode> = vec![node];
                while let Some(sub_node) = dfs.pop() {
                    if let Some(retained) = &sub_node.retained {
                        if !(is_first_level && retained.topic.starts_with('$')) {
                            result.push(retained.clone());
                        }
                    }
                    if let Some(children) = sub_node.children.as_ref() {
                        dfs.extend(children.values());
                    }
                }
                continue;
            }

            let Some(children) = node.children.as_ref() else {
                continue;
            };

            if filter_level == LEVEL_WILDCARD {
                for (level_name, child) in children {
                    if is_first_level && level_name.starts_with('$') {
                        continue;
                    }
                    stack.push((child, level_idx + 1));
                }
            } else if let Some(child) = children.get(filter_level) {
                stack.push((child, level_idx + 1));
            }
        }

        result
    }

    /// Total number of subscriptions across all nodes.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        let mut count = 0;
        let mut stack: Vec<&TopicNode> = vec![&self.root];
        while let Some(node) = stack.pop() {
            count += node.subscribers.len();
            if let Some(children) = node.children.as_ref() {
                stack.extend(children.values());
            }
        }
        count
    }

    /// Number of non-empty retained slots.
    #[must_use]
    pub fn retained_count(&self) -> usize {
        let mut count = 0;
        let mut stack: Vec<&TopicNode> = vec![&self.root];
        while let Some(node) = stack.pop() {
            if node.retained.is_some() {
                count += 1;
            }
            if let Some(children) = node.children.as_ref() {
                stack.extend(children.values());
            }
        }
        count
    }

    /// Drop nodes with no children, no subscribers and no retained message.
    ///
    /// Recursion depth is bounded by `max_topic_levels`, enforced before any
    /// filter reaches the tree. The root is never removed.
    pub fn prune(&mut self) {
        Self::prune_node(&mut self.root);
    }

    fn prune_node(node: &mut TopicNode) {
        if let Some(children) = node.children.as_mut() {
            children.retain(|_level, child| {
                Self::prune_node(child);
                !child.is_empty()
            });
            if children.is_empty() {
                node.children = None;
            }
        }
    }
}

fn collect_grants(result: &mut HashMap<String, QoS>, subscribers: &HashMap<String, QoS>) {
    for (client_id, qos) in subscribers {
        result
            .entry(client_id.clone())
            .and_modify(|granted| {
                if *qos > *granted {
                    *granted = *qos;
                }
            })
            .or_insert(*qos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let mut tree = TopicTree::new();
        tree.subscribe("sensor/temp", "c1", QoS::AtLeastOnce);

        let matched = tree.match_topic("sensor/temp");
        assert_eq!(matched.get("c1"), Some(&QoS::AtLeastOnce));
        assert!(tree.match_topic("sensor/humidity").is_empty());
    }

    #[test]
    fn test_plus_wildcard() {
        let mut tree = TopicTree::new();
        tree.subscribe("home/+/temp", "c1", QoS::AtMostOnce);

        assert!(tree.match_topic("home/kitchen/temp").contains_key("c1"));
        assert!(tree.match_topic("home/bedroom/temp").contains_key("c1"));
        assert!(tree.match_topic("home/kitchen/humidity").is_empty());
        assert!(tree.match_topic("home/temp").is_empty());
    }

    #[test]
    fn test_hash_wildcard() {
        let mut tree = TopicTree::new();
        tree.subscribe("weather/#", "c1", QoS::AtMostOnce);

        assert!(tree.match_topic("weather/rain").contains_key("c1"));
        assert!(tree.match_topic("weather/rain/berlin").contains_key("c1"));
        // 'weather/#' matches 'weather' itself.
        assert!(tree.match_topic("weather").contains_key("c1"));
        assert!(tree.match_topic("news").is_empty());
    }

    #[test]
    fn test_sys_topics_hidden_from_wildcards() {
        let mut tree = TopicTree::new();
        tree.subscribe("#", "c1", QoS::AtMostOnce);
        tree.subscribe("+/broker/uptime", "c2", QoS::AtMostOnce);
        tree.subscribe("$SYS/#", "c3", QoS::AtMostOnce);

        let matched = tree.match_topic("$SYS/broker/uptime");
        assert!(!matched.contains_key("c1"));
        assert!(!matched.contains_key("c2"));
        assert!(matched.contains_key("c3"));

        // Wildcards still work below the first level.
        tree.subscribe("$SYS/+/uptime", "c4", QoS::AtMostOnce);
        assert!(tree.match_topic("$SYS/broker/uptime").contains_key("c4"));
    }

    #[test]
    fn test_overlapping_filters_keep_max_grant() {
        let mut tree = TopicTree::new();
        tree.subscribe("a/b", "c1", QoS::AtMostOnce);
        tree.subscribe("a/+", "c1", QoS::ExactOnce);

        let matched = tree.match_topic("a/b");
        assert_eq!(matched.get("c1"), Some(&QoS::ExactOnce));
    }

    #[test]
    fn test_unsubscribe() {
        let mut tree = TopicTree::new();
        tree.subscribe("a/b", "c1", QoS::AtMostOnce);
        assert!(tree.unsubscribe("a/b", "c1"));
        assert!(!tree.unsubscribe("a/b", "c1"));
        assert!(!tree.unsubscribe("never/seen", "c1"));
        assert!(tree.match_topic("a/b").is_empty());
    }

    #[test]
    fn test_unsubscribe_all_and_count() {
        let mut tree = TopicTree::new();
        tree.subscribe("a/b", "c1", QoS::AtMostOnce);
        tree.subscribe("a/+", "c1", QoS::AtLeastOnce);
        tree.subscribe("c", "c1", QoS::AtMostOnce);
        tree.subscribe("a/b", "c2", QoS::AtMostOnce);
        assert_eq!(tree.subscription_count(), 4);

        tree.unsubscribe_all("c1");
        assert_eq!(tree.subscription_count(), 1);
        assert!(tree.match_topic("a/b").contains_key("c2"));
    }

    #[test]
    fn test_retained_set_get_clear() {
        let mut tree = TopicTree::new();
        tree.set_retained("a/b", b"x", QoS::AtLeastOnce);
        assert_eq!(tree.retained_count(), 1);
        let retained = tree.get_retained("a/b").unwrap();
        assert_eq!(retained.topic, "a/b");
        assert_eq!(&retained.payload[..], b"x");

        tree.set_retained("a/b", b"", QoS::AtMostOnce);
        assert!(tree.get_retained("a/b").is_none());
        assert_eq!(tree.retained_count(), 0);
    }

    #[test]
    fn test_retained_matching_wildcards() {
        let mut tree = TopicTree::new();
        tree.set_retained("home/kitchen/temp", b"20", QoS::AtMostOnce);
        tree.set_retained("home/bedroom/temp", b"18", QoS::AtMostOnce);
        tree.set_retained("home/kitchen/humidity", b"40", QoS::AtMostOnce);

        let mut topics: Vec<String> = tree
            .retained_matching("home/+/temp")
            .into_iter()
            .map(|msg| msg.topic)
            .collect();
        topics.sort();
        assert_eq!(topics, ["home/bedroom/temp", "home/kitchen/temp"]);

        assert_eq!(tree.retained_matching("home/#").len(), 3);
        assert_eq!(tree.retained_matching("#").len(), 3);
    }

    #[test]
    fn test_retained_matching_hides_sys_from_leading_wildcards() {
        let mut tree = TopicTree::new();
        tree.set_retained("$SYS/broker/uptime", b"42", QoS::AtMostOnce);
        tree.set_retained("a", b"1", QoS::AtMostOnce);

        assert_eq!(tree.retained_matching("#").len(), 1);
        assert!(tree.retained_matching("+/broker/uptime").is_empty());
        let matched = tree.retained_matching("$SYS/#");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].topic, "$SYS/broker/uptime");
        assert_eq!(&matched[0].payload[..], b"42");
    }

    #[test]
    fn test_prune() {
        let mut tree = TopicTree::new();
        tree.subscribe("a/b/c", "c1", QoS::AtMostOnce);
        tree.set_retained("a/r", b"x", QoS::AtMostOnce);
        tree.unsubscribe("a/b/c", "c1");

        tree.prune();

        // 'a/b/c' chain is gone, 'a/r' survives through its retained slot.
        assert!(tree.find("a/b").is_none());
        assert!(tree.get_retained("a/r").is_some());

        tree.set_retained("a/r", b"", QoS::AtMostOnce);
        tree.prune();
        assert!(tree.find("a").is_none());
    }
}
