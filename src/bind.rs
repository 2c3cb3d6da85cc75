//! Bind address parsing and per-process endpoint derivation.
//!
//! A single `-b` argument names the logical endpoint of the whole fabric.
//! Every process derives its own concrete endpoint from it: the master
//! binds the bare address, while `worker_i` binds a namespaced variant
//! (a path splice for unix sockets, a port shift for inet sockets). The
//! derivation is deterministic and distinct per namespace, so a bind plus
//! a worker count fully describes the listening topology.

use crate::error::FabricError;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// A parsed listening endpoint, either a unix socket path or host:port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindAddress {
    /// Filesystem endpoint, from the `unix:/path/name.sock` form.
    Unix { path: String },
    /// Network endpoint. `host` keeps the textual form from the input,
    /// brackets included for IPv6.
    Inet { host: String, port: u16 },
}

impl BindAddress {
    /// Parses the CLI grammar:
    ///
    /// - `unix:/absolute/path/<name>.(sock|socket)`
    /// - `HOST:PORT` with HOST an IPv4 address, a bracketed IPv6 address,
    ///   a hostname, or `localhost`, and PORT in `[0, 65535]`
    pub fn parse(input: &str) -> Result<Self, FabricError> {
        if let Some(path) = input.strip_prefix("unix:") {
            return Self::parse_unix(input, path);
        }
        Self::parse_inet(input)
    }

    fn parse_unix(input: &str, path: &str) -> Result<Self, FabricError> {
        let invalid = |reason: &str| FabricError::InvalidBind {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        if !path.starts_with('/') {
            return Err(invalid("unix socket path must be absolute"));
        }
        if path.split('/').skip(1).any(|segment| segment.is_empty()) {
            return Err(invalid("unix socket path has an empty segment"));
        }
        if !(path.ends_with(".sock") || path.ends_with(".socket")) {
            return Err(invalid(
                "unix socket path must end with `.sock` or `.socket`",
            ));
        }
        Ok(BindAddress::Unix {
            path: path.to_string(),
        })
    }

    fn parse_inet(input: &str) -> Result<Self, FabricError> {
        let invalid = |reason: &str| FabricError::InvalidBind {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = input
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected HOST:PORT or unix:/path"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| invalid("port must be an integer in [0, 65535]"))?;

        if host.is_empty() {
            return Err(invalid("host must not be empty"));
        }

        if let Some(v6) = host.strip_prefix('[') {
            let v6 = v6
                .strip_suffix(']')
                .ok_or_else(|| invalid("unbalanced brackets in IPv6 host"))?;
            v6.parse::<Ipv6Addr>()
                .map_err(|_| invalid("invalid IPv6 address"))?;
        } else if host.contains(':') {
            return Err(invalid("IPv6 hosts must be bracketed"));
        } else if host.chars().all(|c| c.is_ascii_digit() || c == '.')
            && host.contains('.')
        {
            host.parse::<Ipv4Addr>()
                .map_err(|_| invalid("invalid IPv4 address"))?;
        } else if !is_hostname(host) {
            return Err(invalid("invalid hostname"));
        }

        Ok(BindAddress::Inet {
            host: host.to_string(),
            port,
        })
    }

    /// True for filesystem endpoints.
    pub fn is_unix(&self) -> bool {
        matches!(self, BindAddress::Unix { .. })
    }

    /// The endpoint this process should bind for the given namespace.
    ///
    /// The master keeps the bare address. A worker namespace is spliced
    /// into a unix path just before its `.sock`/`.socket` suffix (or
    /// appended, suffixing `.socket`, when neither is present); for inet
    /// endpoints the port is shifted by the worker index plus one.
    pub fn namespaced(&self, namespace: &str) -> BindAddress {
        if namespace.is_empty() || namespace == "master" {
            return self.clone();
        }
        match self {
            BindAddress::Unix { path } => {
                let path = if let Some(base) = path.strip_suffix(".socket") {
                    format!("{base}{namespace}.socket")
                } else if let Some(base) = path.strip_suffix(".sock") {
                    format!("{base}{namespace}.sock")
                } else {
                    format!("{path}{namespace}.socket")
                };
                BindAddress::Unix { path }
            }
            BindAddress::Inet { host, port } => {
                let shift = match worker_index(namespace) {
                    Some(i) => i + 1,
                    None => 0,
                };
                BindAddress::Inet {
                    host: host.clone(),
                    port: port + shift as u16,
                }
            }
        }
    }

    /// `host:port` form suitable for `ToSocketAddrs`. Panics on unix
    /// endpoints; callers match on the variant first.
    pub fn authority(&self) -> String {
        match self {
            BindAddress::Unix { .. } => {
                unreachable!("unix endpoints have no inet authority")
            }
            BindAddress::Inet { host, port } => format!("{host}:{port}"),
        }
    }
}

/// Extracts the numeric index from a worker namespace such as `worker_3`.
fn worker_index(namespace: &str) -> Option<usize> {
    let digits: String = namespace.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindAddress::Unix { path } => write!(f, "unix:{path}"),
            BindAddress::Inet { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

fn is_hostname(host: &str) -> bool {
    if host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_bind() {
        let bind = BindAddress::parse("unix:/tmp/rpc.socket").unwrap();
        assert_eq!(
            bind,
            BindAddress::Unix {
                path: "/tmp/rpc.socket".to_string()
            }
        );
        assert!(bind.is_unix());
        assert_eq!(bind.to_string(), "unix:/tmp/rpc.socket");
    }

    #[test]
    fn parses_inet_binds() {
        let bind = BindAddress::parse("127.0.0.1:9000").unwrap();
        assert_eq!(bind.authority(), "127.0.0.1:9000");

        let bind = BindAddress::parse("localhost:80").unwrap();
        assert_eq!(bind.authority(), "localhost:80");

        let bind = BindAddress::parse("[::1]:9000").unwrap();
        assert_eq!(bind.authority(), "[::1]:9000");

        let bind = BindAddress::parse("ws.example.com:443").unwrap();
        assert_eq!(bind.authority(), "ws.example.com:443");
    }

    #[test]
    fn rejects_malformed_binds() {
        for input in [
            "unix:relative/path.sock",
            "unix:/tmp//double.sock",
            "unix:/tmp/nosuffix",
            "127.0.0.1",
            "127.0.0.1:70000",
            "300.1.1.1:80",
            "::1:9000",
            ":9000",
            "-bad-.example:80",
        ] {
            assert!(
                BindAddress::parse(input).is_err(),
                "`{input}` should not parse"
            );
        }
    }

    #[test]
    fn unix_namespacing_splices_before_suffix() {
        let bind = BindAddress::parse("unix:/tmp/rpc.socket").unwrap();
        assert_eq!(
            bind.namespaced("worker_0").to_string(),
            "unix:/tmp/rpcworker_0.socket"
        );
        assert_eq!(
            bind.namespaced("worker_1").to_string(),
            "unix:/tmp/rpcworker_1.socket"
        );

        let bind = BindAddress::parse("unix:/run/ws/fabric.sock").unwrap();
        assert_eq!(
            bind.namespaced("worker_2").to_string(),
            "unix:/run/ws/fabricworker_2.sock"
        );
    }

    #[test]
    fn inet_namespacing_shifts_port() {
        let bind = BindAddress::parse("127.0.0.1:9000").unwrap();
        assert_eq!(bind.namespaced("worker_0").authority(), "127.0.0.1:9001");
        assert_eq!(bind.namespaced("worker_4").authority(), "127.0.0.1:9005");
    }

    #[test]
    fn master_namespace_is_the_bare_address() {
        let bind = BindAddress::parse("127.0.0.1:9000").unwrap();
        assert_eq!(bind.namespaced("master"), bind);
        assert_eq!(bind.namespaced(""), bind);
    }

    #[test]
    fn namespacing_is_injective_over_the_process_set() {
        for input in ["unix:/tmp/rpc.socket", "127.0.0.1:9000"] {
            let bind = BindAddress::parse(input).unwrap();
            let mut seen = std::collections::HashSet::new();
            assert!(seen.insert(bind.namespaced("master")));
            for i in 0..8 {
                assert!(
                    seen.insert(bind.namespaced(&format!("worker_{i}"))),
                    "collision for worker_{i} under {input}"
                );
            }
        }
    }

    #[test]
    fn namespacing_is_deterministic() {
        let bind = BindAddress::parse("unix:/tmp/rpc.socket").unwrap();
        assert_eq!(bind.namespaced("worker_3"), bind.namespaced("worker_3"));
    }
}
