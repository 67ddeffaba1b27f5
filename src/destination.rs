use std::fmt;

use crate::error::{Result, StompError};

/// The kind of a destination, which decides its wire prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    Queue,
    Topic,
    TempQueue,
    TempTopic,
}

/// A named queue or topic.
///
/// Destinations are formatted with a type prefix (`/queue/`, `/topic/`,
/// `/temp-queue/`, `/temp-topic/`) when they are written into a frame. A
/// temporary destination created by another connection uses the
/// `/remote-temp-*` prefixes instead. Incoming names are parsed back into a
/// `Destination` by [`Destination::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    kind: DestinationKind,
    name: String,
    remote: bool,
}

impl Destination {
    pub fn new(kind: DestinationKind, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(StompError::usage("destination name must not be empty"));
        }
        Ok(Self {
            kind,
            name,
            remote: false,
        })
    }

    pub fn queue(name: impl Into<String>) -> Result<Self> {
        Self::new(DestinationKind::Queue, name)
    }

    pub fn topic(name: impl Into<String>) -> Result<Self> {
        Self::new(DestinationKind::Topic, name)
    }

    pub(crate) fn temporary(kind: DestinationKind, name: String) -> Self {
        Self {
            kind,
            name,
            remote: false,
        }
    }

    /// Interpret a destination string as found in `destination` or `reply-to`
    /// headers. Names without a recognised prefix are treated as queues.
    pub fn parse(text: &str) -> Result<Self> {
        const PREFIXES: [(&str, DestinationKind, bool); 6] = [
            ("/queue/", DestinationKind::Queue, false),
            ("/topic/", DestinationKind::Topic, false),
            ("/temp-queue/", DestinationKind::TempQueue, false),
            ("/temp-topic/", DestinationKind::TempTopic, false),
            ("/remote-temp-queue/", DestinationKind::TempQueue, true),
            ("/remote-temp-topic/", DestinationKind::TempTopic, true),
        ];
        for (prefix, kind, remote) in PREFIXES {
            if let Some(name) = text.strip_prefix(prefix) {
                let mut d = Self::new(kind, name)?;
                d.remote = remote;
                return Ok(d);
            }
        }
        Self::queue(text)
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_topic(&self) -> bool {
        matches!(self.kind, DestinationKind::Topic | DestinationKind::TempTopic)
    }

    pub fn is_temporary(&self) -> bool {
        matches!(
            self.kind,
            DestinationKind::TempQueue | DestinationKind::TempTopic
        )
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Wire form of this destination. With `skip_formatting` the physical
    /// name is used verbatim.
    pub fn to_wire(&self, skip_formatting: bool) -> String {
        if skip_formatting {
            return self.name.clone();
        }
        let prefix = match (self.kind, self.remote) {
            (DestinationKind::Queue, _) => "/queue/",
            (DestinationKind::Topic, _) => "/topic/",
            (DestinationKind::TempQueue, false) => "/temp-queue/",
            (DestinationKind::TempTopic, false) => "/temp-topic/",
            (DestinationKind::TempQueue, true) => "/remote-temp-queue/",
            (DestinationKind::TempTopic, true) => "/remote-temp-topic/",
        };
        format!("{}{}", prefix, self.name)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_follow_kind() {
        assert_eq!(Destination::queue("a").unwrap().to_wire(false), "/queue/a");
        assert_eq!(Destination::topic("b").unwrap().to_wire(false), "/topic/b");
        assert_eq!(Destination::topic("b").unwrap().to_wire(true), "b");
    }

    #[test]
    fn parse_recognises_remote_temporaries() {
        let d = Destination::parse("/remote-temp-queue/ID:x:1").unwrap();
        assert_eq!(d.kind(), DestinationKind::TempQueue);
        assert!(d.is_remote());
        assert_eq!(d.name(), "ID:x:1");
        assert_eq!(d.to_wire(false), "/remote-temp-queue/ID:x:1");
    }

    #[test]
    fn unprefixed_names_are_queues() {
        let d = Destination::parse("orders").unwrap();
        assert_eq!(d.kind(), DestinationKind::Queue);
    }

    #[test]
    fn empty_name_is_usage_error() {
        assert!(matches!(Destination::queue(""), Err(StompError::Usage(_))));
        assert!(Destination::parse("/topic/").is_err());
    }
}
