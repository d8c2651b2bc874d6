//! SDP session description model
//!
//! Structured representation of the parts of a session description the core
//! negotiates over: the origin line, the session-level connection address and
//! the ordered media list. Parsing and serialization of the SDP grammar live
//! with the transport layer; the core only composes and compares these values.

use serde::{Deserialize, Serialize};

/// Media flow direction, as carried by the `sendrecv`/`sendonly`/`recvonly`/
/// `inactive` attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "sendrecv" => Some(Direction::SendRecv),
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }

    /// The direction as seen from the other party.
    pub fn reversed(&self) -> Self {
        match self {
            Direction::SendOnly => Direction::RecvOnly,
            Direction::RecvOnly => Direction::SendOnly,
            other => *other,
        }
    }

    /// True when this direction means the party describing it has stopped
    /// receiving media, i.e. it put the other side on hold.
    pub fn is_hold(&self) -> bool {
        matches!(self, Direction::SendOnly | Direction::Inactive)
    }
}

const DIRECTION_ATTRIBUTES: [&str; 4] = ["sendrecv", "sendonly", "recvonly", "inactive"];

/// `o=` line: identifies the session originator and carries the version
/// number that every re-negotiation must increment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub username: String,
    pub session_id: u64,
    pub version: u64,
    pub net_type: String,
    pub address_type: String,
    pub address: String,
}

impl Origin {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            username: "-".to_string(),
            session_id: rand::random::<u32>() as u64,
            version: 1,
            net_type: "IN".to_string(),
            address_type: "IP4".to_string(),
            address: address.into(),
        }
    }

    /// Compares the identifying fields of the `o=` line, ignoring the version.
    /// A mid-dialog offer whose owner fields differ describes a different
    /// session and must be rejected.
    pub fn same_owner(&self, other: &Origin) -> bool {
        self.username == other.username
            && self.net_type == other.net_type
            && self.address_type == other.address_type
            && self.address == other.address
    }
}

/// `c=` line at session or media level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub net_type: String,
    pub address_type: String,
    pub address: String,
}

impl Connection {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            net_type: "IN".to_string(),
            address_type: "IP4".to_string(),
            address: address.into(),
        }
    }
}

/// `a=` attribute: a name with an optional value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: Option<String>,
}

impl Attribute {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self { name: name.into(), value: Some(value.into()) }
    }

    pub fn flag<N: Into<String>>(name: N) -> Self {
        Self { name: name.into(), value: None }
    }
}

/// One `m=` line with its attributes. Its position in the owning session
/// description is the stream index used across re-negotiations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescription {
    pub media_type: String,
    pub port: u16,
    pub transport: String,
    pub formats: Vec<String>,
    pub connection: Option<Connection>,
    pub attributes: Vec<Attribute>,
}

impl MediaDescription {
    pub fn new<M: Into<String>, T: Into<String>>(media_type: M, port: u16, transport: T) -> Self {
        Self {
            media_type: media_type.into(),
            port,
            transport: transport.into(),
            formats: Vec::new(),
            connection: None,
            attributes: Vec::new(),
        }
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|attr| attr.name == name)
    }

    pub fn attribute_value(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.name == name)
            .and_then(|attr| attr.value.as_deref())
    }

    /// The declared direction, defaulting to `sendrecv` when absent.
    pub fn direction(&self) -> Direction {
        self.attributes
            .iter()
            .find_map(|attr| Direction::from_str(&attr.name))
            .unwrap_or(Direction::SendRecv)
    }

    pub fn set_direction(&mut self, direction: Direction) {
        self.attributes.retain(|attr| !DIRECTION_ATTRIBUTES.contains(&attr.name.as_str()));
        self.attributes.push(Attribute::flag(direction.as_str()));
    }

    /// A zero-port copy used to decline this media line in an answer.
    pub fn rejected(&self) -> Self {
        let mut media = self.clone();
        media.port = 0;
        media
    }

    /// Address of the first server-reflexive ("S" type) candidate carried by
    /// this media line, if any.
    pub fn server_reflexive_address(&self) -> Option<String> {
        self.attributes
            .iter()
            .filter(|attr| attr.name == "candidate")
            .filter_map(|attr| attr.value.as_deref())
            .filter(|value| value.starts_with("S "))
            .filter_map(|value| value.split(' ').nth(4))
            .map(|address| address.to_string())
            .next()
    }
}

/// A full session description: origin, session-level connection and the
/// ordered media list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub origin: Origin,
    pub name: String,
    pub connection: Option<Connection>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn new<A: Into<String>, N: Into<String>>(address: A, name: N) -> Self {
        let address = address.into();
        Self {
            origin: Origin::new(address.clone()),
            name: name.into(),
            connection: Some(Connection::new(address)),
            media: Vec::new(),
        }
    }

    /// Every modification sent in a re-INVITE must carry a higher version.
    pub fn bump_version(&mut self) {
        self.origin.version += 1;
    }

    pub fn set_connection_address<S: Into<String>>(&mut self, address: S) {
        let address = address.into();
        match &mut self.connection {
            Some(connection) => connection.address = address,
            None => self.connection = Some(Connection::new(address)),
        }
    }
}
