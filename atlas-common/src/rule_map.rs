use crate::{ContainerNetInfo, Rule, RuleKey};
use std::collections::HashMap;

/// Values stored in a [`RuleMap`]
///
/// Agents keep extra, never transmitted, context next to the wire form; the
/// map only needs to see the wire form to flatten itself back into rules.
pub trait RuleValue: Clone {
    fn net_info(&self) -> &ContainerNetInfo;
}

impl RuleValue for ContainerNetInfo {
    fn net_info(&self) -> &ContainerNetInfo {
        self
    }
}

/// Nested `node IP -> public port -> value` map
///
/// Holds at most one value per key. Applying a deletion removes the key, and
/// a node whose last port is removed disappears, so a map flattened with
/// [`RuleMap::to_rules`] and rebuilt with [`RuleMap::from_rules`] compares
/// equal to the original.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleMap<V = ContainerNetInfo> {
    nodes: HashMap<String, HashMap<u32, V>>,
}

impl<V> Default for RuleMap<V> {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }
}

impl<V: RuleValue> RuleMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one rule: remove the key if the value is a deletion, upsert otherwise
    pub fn accept(&mut self, key: &RuleKey, value: V) {
        if value.net_info().is_deleted {
            self.remove(key);
        } else {
            self.insert(key.clone(), value);
        }
    }

    pub fn insert(&mut self, key: RuleKey, value: V) -> Option<V> {
        self.nodes
            .entry(key.node_ip)
            .or_default()
            .insert(key.public_port, value)
    }

    pub fn remove(&mut self, key: &RuleKey) -> Option<V> {
        let ports = self.nodes.get_mut(&key.node_ip)?;
        let removed = ports.remove(&key.public_port);
        if ports.is_empty() {
            self.nodes.remove(&key.node_ip);
        }
        removed
    }

    pub fn get(&self, node_ip: &str, public_port: u32) -> Option<&V> {
        self.nodes.get(node_ip)?.get(&public_port)
    }

    /// All ports published on one node
    pub fn node(&self, node_ip: &str) -> Option<&HashMap<u32, V>> {
        self.nodes.get(node_ip)
    }

    /// Replace everything known about `node_ip`
    pub fn replace_node(&mut self, node_ip: &str, entries: impl IntoIterator<Item = (u32, V)>) {
        let ports: HashMap<u32, V> = entries
            .into_iter()
            .filter(|(_, v)| !v.net_info().is_deleted)
            .collect();
        if ports.is_empty() {
            self.nodes.remove(node_ip);
        } else {
            self.nodes.insert(node_ip.to_string(), ports);
        }
    }

    pub fn contains_node(&self, node_ip: &str) -> bool {
        self.nodes.contains_key(node_ip)
    }

    pub fn node_ips(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Iterate `(node IP, public port, value)` in unspecified order
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32, &V)> {
        self.nodes.iter().flat_map(|(node_ip, ports)| {
            ports
                .iter()
                .map(move |(port, value)| (node_ip.as_str(), *port, value))
        })
    }

    /// Total number of (node, port) entries
    pub fn len(&self) -> usize {
        self.nodes.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Flatten into wire rules
    pub fn to_rules(&self) -> Vec<Rule> {
        self.iter()
            .map(|(node_ip, port, value)| {
                Rule::new(RuleKey::new(node_ip, port), value.net_info().clone())
            })
            .collect()
    }
}

impl RuleMap<ContainerNetInfo> {
    /// Build a map by applying `rules` in order
    pub fn from_rules<I: IntoIterator<Item = Rule>>(rules: I) -> Self {
        rules.into_iter().collect()
    }
}

impl FromIterator<Rule> for RuleMap<ContainerNetInfo> {
    fn from_iter<I: IntoIterator<Item = Rule>>(iter: I) -> Self {
        let mut map = Self::new();
        for rule in iter {
            map.accept(&rule.key, rule.container);
        }
        map
    }
}
