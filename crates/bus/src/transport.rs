use std::fmt;

/// A ZeroMQ TCP endpoint: where a queue socket binds or connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transport {
    pub host: String,
    pub port: u16,
}

impl Transport {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `tcp://host:port`, as ZeroMQ expects it.
    pub fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.endpoint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_tcp_url() {
        let t = Transport::tcp("broker", 5560);
        assert_eq!(t.endpoint(), "tcp://broker:5560");
        assert_eq!(t.to_string(), t.endpoint());
    }
}
