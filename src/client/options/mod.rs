//! Options for how a [`Client`](crate::Client) connects to a deployment,
//! including the connection-string parser.

use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    time::Duration,
};

use percent_encoding::percent_decode_str;
use typed_builder::TypedBuilder;

use crate::{
    concern::{Acknowledgment, WriteConcern},
    error::{Error, ErrorKind, Result},
    selection_criteria::{ReadPreference, TagSet},
};

pub(crate) const DEFAULT_PORT: u16 = 27017;

/// An address a deployment member listens on: a TCP/IP host and port, or a
/// UNIX domain socket path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address where the server can be found.
        host: String,

        /// The TCP port the server is listening on. The default is 27017.
        port: Option<u16>,
    },
    /// A UNIX domain socket path, ending in `.sock`.
    #[cfg(unix)]
    Unix {
        /// The path to the UNIX domain socket.
        path: PathBuf,
    },
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                write!(fmt, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
            }
            #[cfg(unix)]
            Self::Unix { path } => write!(fmt, "{}", path.display()),
        }
    }
}

impl ServerAddress {
    /// Parses an address from a `host`, `host:port`, or percent-encoded
    /// UNIX socket path string.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();

        #[cfg(unix)]
        if address.ends_with(".sock") {
            let path = percent_decode_str(address)
                .decode_utf8()
                .map_err(|_| invalid_uri("UNIX socket path is not valid UTF-8"))?;
            return Ok(Self::Unix {
                path: PathBuf::from(path.into_owned()),
            });
        }

        let mut parts = address.split(':');
        let host = parts
            .next()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid_uri("empty host"))?;

        let port = match parts.next() {
            Some(port_str) => {
                let port: u16 = port_str.parse().map_err(|_| {
                    invalid_uri(format!("invalid port \"{}\" for host {}", port_str, host))
                })?;
                Some(port)
            }
            None => None,
        };

        if parts.next().is_some() {
            return Err(invalid_uri(format!("invalid address \"{}\"", address)));
        }

        Ok(Self::Tcp {
            host: host.to_string(),
            port,
        })
    }

    /// The string handed to the resolver for TCP addresses.
    pub(crate) fn to_lookup_string(&self) -> String {
        match self {
            Self::Tcp { host, port } => format!("{}:{}", host, port.unwrap_or(DEFAULT_PORT)),
            #[cfg(unix)]
            Self::Unix { path } => path.display().to_string(),
        }
    }

    /// The hostname presented for TLS verification.
    pub(crate) fn host_str(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
            #[cfg(unix)]
            Self::Unix { .. } => "localhost",
        }
    }
}

/// Configuration for TLS connections.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
pub struct TlsOptions {
    /// Whether the driver should skip certificate and hostname verification.
    /// Never enable this outside of testing.
    pub allow_invalid_certificates: Option<bool>,

    /// Path to a PEM file with the root certificates trusted for server
    /// verification. The system trust store is used when unset.
    pub ca_file_path: Option<PathBuf>,

    /// Path to a PEM file with the client certificate and private key.
    pub cert_key_file_path: Option<PathBuf>,
}

/// Credentials for the challenge-response authentication handshake.
#[derive(Clone, Default, PartialEq)]
#[non_exhaustive]
pub struct Credential {
    /// The authenticating user's name.
    pub username: String,

    /// The authenticating user's password.
    pub password: String,

    /// The database the credentials are defined on. Defaults to `admin`.
    pub source: Option<String>,
}

impl Credential {
    pub(crate) fn source_db(&self) -> &str {
        self.source.as_deref().unwrap_or("admin")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        // Zero the password bytes before the allocation is returned.
        let mut bytes = std::mem::take(&mut self.password).into_bytes();
        bytes.fill(0);
    }
}

/// Contains the options that can be used to create a new [`Client`](crate::Client).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default))]
#[non_exhaustive]
pub struct ClientOptions {
    /// The initial list of seeds that the client connects to.
    pub hosts: Vec<ServerAddress>,

    /// The name of the replica set the client connects to. Its presence
    /// switches the cluster into replica-set mode.
    #[builder(setter(strip_option))]
    pub repl_set_name: Option<String>,

    /// The credentials to authenticate each connection with.
    #[builder(setter(strip_option))]
    pub credential: Option<Credential>,

    /// TLS configuration; `None` disables TLS.
    #[builder(setter(strip_option))]
    pub tls_options: Option<TlsOptions>,

    /// The connect timeout per socket connection attempt (default 10s).
    #[builder(setter(strip_option))]
    pub connect_timeout: Option<Duration>,

    /// How long a send or receive on an established socket may block
    /// (default 300s).
    #[builder(setter(strip_option))]
    pub socket_timeout: Option<Duration>,

    /// How much farther than the nearest node, in milliseconds, a secondary
    /// may be and still serve reads (default 15).
    #[builder(setter(strip_option))]
    pub secondary_acceptable_latency: Option<Duration>,

    /// Whether queries may be served by secondaries by default.
    #[builder(setter(strip_option))]
    pub slave_ok: Option<bool>,

    /// The default write concern for operations through this client.
    #[builder(setter(strip_option))]
    pub write_concern: Option<WriteConcern>,

    /// The default read preference for operations through this client.
    #[builder(setter(strip_option))]
    pub read_preference: Option<ReadPreference>,

    /// The default database for operations, from the connection string path.
    #[builder(setter(strip_option))]
    pub default_database: Option<String>,

    /// Upper bound used by pooling wrappers; unused by a bare client.
    #[builder(setter(strip_option))]
    pub max_pool_size: Option<u32>,

    /// Lower bound used by pooling wrappers; unused by a bare client.
    #[builder(setter(strip_option))]
    pub min_pool_size: Option<u32>,
}

impl ClientOptions {
    /// Parses a MongoDB connection string into a [`ClientOptions`] struct.
    ///
    /// ```text
    /// mongodb://[user:pass@]host1[:port1][,...hostN[:portN]][/[db][?options]]
    /// ```
    pub fn parse(uri: impl AsRef<str>) -> Result<Self> {
        let uri = uri.as_ref();

        let rest = uri
            .strip_prefix("mongodb://")
            .ok_or_else(|| invalid_uri("connection strings must begin with \"mongodb://\""))?;

        let (userinfo, host_section) = match rest.rfind('@') {
            Some(idx) => (Some(&rest[..idx]), &rest[idx + 1..]),
            None => (None, rest),
        };

        let (hosts_str, path_and_query) = match host_section.find('/') {
            Some(idx) => (&host_section[..idx], Some(&host_section[idx + 1..])),
            None => (host_section, None),
        };

        if hosts_str.is_empty() {
            return Err(invalid_uri("missing host list"));
        }

        let hosts = hosts_str
            .split(',')
            .map(ServerAddress::parse)
            .collect::<Result<Vec<_>>>()?;

        let mut options = ClientOptions {
            hosts,
            ..Default::default()
        };

        if let Some(userinfo) = userinfo {
            let (username, password) = match userinfo.split_once(':') {
                Some((u, p)) => (u, p),
                None => (userinfo, ""),
            };
            options.credential = Some(Credential {
                username: percent_decode(username, "username")?,
                password: percent_decode(password, "password")?,
                source: None,
            });
        }

        let (database, query) = match path_and_query {
            Some(s) => match s.split_once('?') {
                Some((db, query)) => (db, Some(query)),
                None => (s, None),
            },
            None => ("", None),
        };

        if !database.is_empty() {
            options.default_database = Some(percent_decode(database, "database name")?);
        }

        if let Some(query) = query {
            options.apply_uri_options(query)?;
        }

        Ok(options)
    }

    fn apply_uri_options(&mut self, query: &str) -> Result<()> {
        let mut tag_sets: Vec<TagSet> = Vec::new();
        let mut wc = WriteConcern::default();
        let mut wc_seen = false;
        let mut tls_requested = false;

        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid_uri(format!("option \"{}\" has no value", pair)))?;
            let value = percent_decode(value, key)?;

            // Option names are matched case-insensitively.
            match key.to_ascii_lowercase().as_str() {
                "replicaset" => self.repl_set_name = Some(value),
                "slaveok" => self.slave_ok = Some(parse_bool(key, &value)?),
                "ssl" => tls_requested = parse_bool(key, &value)?,
                "authsource" => {
                    if let Some(ref mut credential) = self.credential {
                        credential.source = Some(value);
                    }
                }
                "connecttimeoutms" => {
                    self.connect_timeout = Some(Duration::from_millis(parse_u64(key, &value)?))
                }
                "sockettimeoutms" => {
                    self.socket_timeout = Some(Duration::from_millis(parse_u64(key, &value)?))
                }
                "secondaryacceptablelatencyms" => {
                    self.secondary_acceptable_latency =
                        Some(Duration::from_millis(parse_u64(key, &value)?))
                }
                "w" => {
                    wc.w = Some(match value.parse::<i32>() {
                        Ok(n) => Acknowledgment::Nodes(n),
                        Err(_) => Acknowledgment::from(value),
                    });
                    wc_seen = true;
                }
                "journal" => {
                    wc.journal = Some(parse_bool(key, &value)?);
                    wc_seen = true;
                }
                "wtimeoutms" => {
                    wc.w_timeout = Some(parse_u64(key, &value)? as i32);
                    wc_seen = true;
                }
                "readpreferencetags" => {
                    tag_sets.push(parse_tag_set(&value)?);
                }
                "maxpoolsize" => self.max_pool_size = Some(parse_u64(key, &value)? as u32),
                "minpoolsize" => self.min_pool_size = Some(parse_u64(key, &value)? as u32),
                other => {
                    tracing::warn!(option = other, "ignoring unsupported URI option");
                }
            }
        }

        if tls_requested && self.tls_options.is_none() {
            self.tls_options = Some(TlsOptions::default());
        }

        if wc_seen {
            self.write_concern = Some(wc);
        }

        if !tag_sets.is_empty() {
            let base = match self.read_preference.take() {
                Some(pref) => pref,
                None if self.slave_ok == Some(true) => {
                    ReadPreference::SecondaryPreferred { tag_sets: None }
                }
                None => ReadPreference::Nearest { tag_sets: None },
            };
            self.read_preference = Some(base.with_tags(tag_sets)?);
        } else if self.slave_ok == Some(true) && self.read_preference.is_none() {
            self.read_preference = Some(ReadPreference::SecondaryPreferred { tag_sets: None });
        }

        Ok(())
    }
}

/// Parses `dc:ny,rack:1` into a tag set.
fn parse_tag_set(value: &str) -> Result<TagSet> {
    let mut tag_set = HashMap::new();
    if value.is_empty() {
        return Ok(tag_set);
    }
    for pair in value.split(',') {
        let (tag, tag_value) = pair
            .split_once(':')
            .ok_or_else(|| invalid_uri(format!("invalid read preference tag \"{}\"", pair)))?;
        tag_set.insert(tag.trim().to_string(), tag_value.trim().to_string());
    }
    Ok(tag_set)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid_uri(format!(
            "option {} requires \"true\" or \"false\", got \"{}\"",
            key, value
        ))),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| invalid_uri(format!("option {} requires an integer, got \"{}\"", key, value)))
}

fn percent_decode(value: &str, what: &str) -> Result<String> {
    percent_decode_str(value)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| invalid_uri(format!("{} is not valid percent-encoded UTF-8", what)))
}

fn invalid_uri(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidArgument {
        message: message.into(),
    })
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{ClientOptions, ServerAddress};
    use crate::{concern::Acknowledgment, selection_criteria::ReadPreference};

    #[test]
    fn parses_hosts_and_database() {
        let options = ClientOptions::parse("mongodb://a:27018,b/things").unwrap();
        assert_eq!(
            options.hosts,
            vec![
                ServerAddress::Tcp {
                    host: "a".into(),
                    port: Some(27018)
                },
                ServerAddress::Tcp {
                    host: "b".into(),
                    port: None
                },
            ]
        );
        assert_eq!(options.default_database.as_deref(), Some("things"));
    }

    #[test]
    fn parses_credentials_and_options() {
        let options = ClientOptions::parse(
            "mongodb://us%40er:p%40ss@h:27017/db?authSource=other&replicaSet=rs0&w=majority&\
             connectTimeoutMS=2000&secondaryAcceptableLatencyMS=20",
        )
        .unwrap();

        let credential = options.credential.as_ref().unwrap();
        assert_eq!(credential.username, "us@er");
        assert_eq!(credential.password, "p@ss");
        assert_eq!(credential.source.as_deref(), Some("other"));
        assert_eq!(options.repl_set_name.as_deref(), Some("rs0"));
        assert_eq!(
            options.write_concern.unwrap().w,
            Some(Acknowledgment::Majority)
        );
        assert_eq!(options.connect_timeout, Some(Duration::from_millis(2000)));
        assert_eq!(
            options.secondary_acceptable_latency,
            Some(Duration::from_millis(20))
        );
    }

    #[test]
    fn parses_read_preference_tags() {
        let options = ClientOptions::parse(
            "mongodb://h/?slaveOk=true&readPreferenceTags=dc:ny,rack:1&readPreferenceTags=dc:sf",
        )
        .unwrap();

        match options.read_preference {
            Some(ReadPreference::SecondaryPreferred { tag_sets: Some(sets) }) => {
                assert_eq!(sets.len(), 2);
                assert_eq!(sets[0].get("dc").map(String::as_str), Some("ny"));
                assert_eq!(sets[0].get("rack").map(String::as_str), Some("1"));
                assert_eq!(sets[1].get("dc").map(String::as_str), Some("sf"));
            }
            ref other => panic!("unexpected read preference {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn parses_unix_socket_paths() {
        let options = ClientOptions::parse("mongodb://%2Ftmp%2Fmongodb-27017.sock").unwrap();
        assert_eq!(
            options.hosts,
            vec![ServerAddress::Unix {
                path: "/tmp/mongodb-27017.sock".into()
            }]
        );
    }

    #[test]
    fn rejects_malformed_uris() {
        ClientOptions::parse("http://h").unwrap_err();
        ClientOptions::parse("mongodb://").unwrap_err();
        ClientOptions::parse("mongodb://h:badport").unwrap_err();
        ClientOptions::parse("mongodb://h/?connectTimeoutMS=abc").unwrap_err();
    }
}
