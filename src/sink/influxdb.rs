use crate::metric::Metric;
use crate::protocols::line;
use crate::sink::{Sink, SinkError};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

/// InfluxDB sink, speaking line protocol over UDP.
///
/// Lines are packed into datagrams of at most `max_payload_size` bytes. A
/// single line larger than that can never be delivered and fails the batch
/// fatally; socket errors are retryable.
pub struct InfluxDB {
    host: String,
    port: u16,
    max_payload_size: usize,
    socket: Option<(UdpSocket, SocketAddr)>,
    payload: String,
}

/// Configuration for the `InfluxDB` sink
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct InfluxDBConfig {
    /// Host running InfluxDB's UDP listener.
    pub host: String,
    /// UDP port.
    pub port: u16,
    /// Largest datagram to send.
    pub max_payload_size: usize,
}

impl Default for InfluxDBConfig {
    fn default() -> InfluxDBConfig {
        InfluxDBConfig {
            host: "127.0.0.1".to_string(),
            port: 8089,
            max_payload_size: 512,
        }
    }
}

impl InfluxDB {
    /// Create a new InfluxDB sink. No socket is opened until `connect`.
    pub fn new(config: InfluxDBConfig) -> InfluxDB {
        InfluxDB {
            host: config.host,
            port: config.port,
            max_payload_size: config.max_payload_size.max(1),
            socket: None,
            payload: String::with_capacity(config.max_payload_size),
        }
    }

    fn send(&mut self) -> Result<(), SinkError> {
        if self.payload.is_empty() {
            return Ok(());
        }
        if self.socket.is_none() {
            self.connect()?;
        }
        let res = match self.socket {
            Some((ref socket, addr)) => socket.send_to(self.payload.as_bytes(), addr),
            None => return Err(SinkError::Retryable("not connected".to_string())),
        };
        self.payload.clear();
        match res {
            Ok(_) => Ok(()),
            Err(e) => {
                // resolve and bind afresh on the next attempt
                self.socket = None;
                Err(SinkError::Retryable(format!(
                    "unable to send to {}:{}: {}",
                    self.host, self.port, e
                )))
            }
        }
    }
}

impl Sink for InfluxDB {
    fn connect(&mut self) -> Result<(), SinkError> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| {
                SinkError::Retryable(format!("unable to perform DNS lookup on host {}: {}", self.host, e))
            })?
            .next()
            .ok_or_else(|| SinkError::Retryable(format!("no address for host {}", self.host)))?;
        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind)
            .map_err(|e| SinkError::Retryable(format!("unable to bind {}: {}", bind, e)))?;
        self.socket = Some((socket, addr));
        Ok(())
    }

    fn write(&mut self, batch: &[Metric]) -> Result<(), SinkError> {
        self.payload.clear();
        let mut line_buf = String::with_capacity(256);
        for metric in batch {
            line_buf.clear();
            if !line::write_metric(metric, &mut line_buf) {
                continue;
            }
            if line_buf.len() > self.max_payload_size {
                self.payload.clear();
                return Err(SinkError::Fatal(format!(
                    "line of {} bytes exceeds max payload size {}",
                    line_buf.len(),
                    self.max_payload_size
                )));
            }
            if self.payload.len() + line_buf.len() > self.max_payload_size {
                self.send()?;
            }
            self.payload.push_str(&line_buf);
        }
        self.send()
    }

    fn close(&mut self) {
        self.socket = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn listener() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    fn recv(socket: &UdpSocket) -> String {
        let mut buf = [0u8; 2048];
        let n = socket.recv(&mut buf).unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[test]
    fn packs_lines_into_datagrams() {
        let (server, port) = listener();
        let mut sink = InfluxDB::new(InfluxDBConfig {
            port,
            max_payload_size: 30,
            ..Default::default()
        });
        sink.connect().unwrap();
        let batch: Vec<Metric> = (0..3).map(|i| Metric::new("m").field("v", i).time(i)).collect();
        sink.write(&batch).unwrap();
        // each line is 9 bytes, three fit in one datagram
        assert_eq!("m v=0i 0\nm v=1i 1\nm v=2i 2\n", recv(&server));

        let batch: Vec<Metric> = (0..4).map(|i| Metric::new("m").field("v", i).time(i)).collect();
        sink.write(&batch).unwrap();
        assert_eq!("m v=0i 0\nm v=1i 1\nm v=2i 2\n", recv(&server));
        assert_eq!("m v=3i 3\n", recv(&server));
    }

    #[test]
    fn oversize_line_is_fatal() {
        let (_server, port) = listener();
        let mut sink = InfluxDB::new(InfluxDBConfig {
            port,
            max_payload_size: 8,
            ..Default::default()
        });
        match sink.write(&[Metric::new("long_name").field("v", 1).time(1)]) {
            Err(SinkError::Fatal(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
