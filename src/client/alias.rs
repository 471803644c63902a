//! Topic alias tables.
//!
//! MQTT 5.0 lets either peer substitute a small integer for a topic name
//! within a single network connection. The two directions are
//! independent: the inbound table resolves aliases the server sends us,
//! the outbound table assigns aliases to topics we publish. Both are
//! rebuilt on every new connection; aliases never survive a reconnect.

use crate::error::MqttError;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Inbound (server-to-client)
// ---------------------------------------------------------------------------

/// Resolves topic aliases on received PUBLISH packets.
///
/// The maximum comes from the client's own `topic_alias_maximum`
/// configuration; 0 disables inbound aliasing entirely.
#[derive(Debug, Default)]
pub struct InboundAliasTable {
    aliases: HashMap<u16, String>,
    max_alias: u16,
}

impl InboundAliasTable {
    pub fn new(max_alias: u16) -> Self {
        Self {
            aliases: HashMap::new(),
            max_alias,
        }
    }

    /// Resolve the effective topic of a received PUBLISH.
    ///
    /// A non-empty topic with an alias registers the mapping; an empty
    /// topic with an alias looks it up. Out-of-range aliases and lookups
    /// of unregistered aliases are protocol errors, as is an empty topic
    /// without any alias.
    pub fn resolve(&mut self, topic: &str, alias: Option<u16>) -> Result<String, MqttError> {
        match alias {
            Some(alias) => {
                if alias == 0 || alias > self.max_alias {
                    return Err(MqttError::protocol(format!(
                        "topic alias {alias} outside [1, {}]",
                        self.max_alias
                    )));
                }
                if topic.is_empty() {
                    self.aliases.get(&alias).cloned().ok_or_else(|| {
                        MqttError::protocol(format!("unknown topic alias {alias}"))
                    })
                } else {
                    self.aliases.insert(alias, topic.to_string());
                    Ok(topic.to_string())
                }
            }
            None if topic.is_empty() => {
                Err(MqttError::protocol("publish with empty topic and no alias"))
            }
            None => Ok(topic.to_string()),
        }
    }

    pub fn clear(&mut self) {
        self.aliases.clear();
    }
}

// ---------------------------------------------------------------------------
// Outbound (client-to-server)
// ---------------------------------------------------------------------------

/// Assigns aliases to topics we publish.
///
/// The maximum comes from the server's `TopicAliasMaximum` CONNACK
/// property. Assignment is sequential and there is no eviction: once the
/// table is full, further topics are published without an alias.
#[derive(Debug, Default)]
pub struct OutboundAliasTable {
    topic_to_alias: HashMap<String, u16>,
    next_alias: u16,
    max_alias: u16,
}

impl OutboundAliasTable {
    pub fn new(max_alias: u16) -> Self {
        Self {
            topic_to_alias: HashMap::new(),
            next_alias: 1,
            max_alias,
        }
    }

    /// Rewrite an outgoing topic for the wire.
    ///
    /// Returns `(wire_topic, alias)`: a known topic becomes an empty
    /// wire topic plus its alias, a new topic is assigned the next free
    /// alias and sent in full, and once aliases are exhausted the topic
    /// passes through unchanged.
    pub fn apply(&mut self, topic: &str) -> (String, Option<u16>) {
        if self.max_alias == 0 {
            return (topic.to_string(), None);
        }
        if let Some(&alias) = self.topic_to_alias.get(topic) {
            return (String::new(), Some(alias));
        }
        if self.next_alias <= self.max_alias {
            let alias = self.next_alias;
            self.next_alias += 1;
            self.topic_to_alias.insert(topic.to_string(), alias);
            return (topic.to_string(), Some(alias));
        }
        (topic.to_string(), None)
    }

    pub fn clear(&mut self) {
        self.topic_to_alias.clear();
        self.next_alias = 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_registers_and_resolves() {
        let mut table = InboundAliasTable::new(10);
        assert_eq!(table.resolve("sensors/temp", Some(1)).unwrap(), "sensors/temp");
        assert_eq!(table.resolve("", Some(1)).unwrap(), "sensors/temp");
        // re-registration replaces the mapping
        assert_eq!(table.resolve("sensors/hum", Some(1)).unwrap(), "sensors/hum");
        assert_eq!(table.resolve("", Some(1)).unwrap(), "sensors/hum");
    }

    #[test]
    fn test_inbound_unknown_alias_fails() {
        let mut table = InboundAliasTable::new(10);
        assert!(matches!(
            table.resolve("", Some(5)),
            Err(MqttError::Protocol(_))
        ));
    }

    #[test]
    fn test_inbound_out_of_range_alias_fails() {
        let mut table = InboundAliasTable::new(2);
        assert!(table.resolve("t", Some(0)).is_err());
        assert!(table.resolve("t", Some(3)).is_err());
    }

    #[test]
    fn test_inbound_plain_topic_passes_through() {
        let mut table = InboundAliasTable::new(0);
        assert_eq!(table.resolve("plain/topic", None).unwrap(), "plain/topic");
        assert!(table.resolve("", None).is_err());
    }

    #[test]
    fn test_inbound_clear() {
        let mut table = InboundAliasTable::new(4);
        table.resolve("t", Some(2)).unwrap();
        table.clear();
        assert!(table.resolve("", Some(2)).is_err());
    }

    #[test]
    fn test_outbound_assignment_and_reuse() {
        let mut table = OutboundAliasTable::new(2);

        assert_eq!(table.apply("a"), ("a".to_string(), Some(1)));
        assert_eq!(table.apply("b"), ("b".to_string(), Some(2)));
        // repeats collapse to the alias alone
        assert_eq!(table.apply("a"), (String::new(), Some(1)));
        assert_eq!(table.apply("b"), (String::new(), Some(2)));
        // table full: no alias, no eviction
        assert_eq!(table.apply("c"), ("c".to_string(), None));
        assert_eq!(table.apply("a"), (String::new(), Some(1)));
    }

    #[test]
    fn test_outbound_disabled() {
        let mut table = OutboundAliasTable::new(0);
        assert_eq!(table.apply("a"), ("a".to_string(), None));
    }

    #[test]
    fn test_outbound_clear_restarts_assignment() {
        let mut table = OutboundAliasTable::new(4);
        table.apply("a");
        table.apply("b");
        table.clear();
        assert_eq!(table.apply("z"), ("z".to_string(), Some(1)));
    }
}
