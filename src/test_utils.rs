use crate::device::{Command, Connector, DeviceError, Link};
use crate::output::{PublishError, PublishFuture, Publisher};
use crate::reading::Reading;
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::Notify;

/// Something observable that happened on the fake device or a fake publisher.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connect,
    Write(String),
    Discard,
    Publish(&'static str),
}

/// Shared, ordered record of events across the device and publishers.
pub type EventLog = Arc<Mutex<Vec<Event>>>;

/// A reading that every online test can share.
pub fn online_reading() -> Reading {
    Reading {
        temperature: 21.5,
        cpm: 18,
        version: "GMC-320Re 4.22".to_string(),
        is_online: true,
    }
}

#[derive(Debug)]
struct Script {
    cpm: [u8; 2],
    temperature: [u8; 4],
    version: [u8; 14],
    /// Bytes the device has sent but nobody has read yet
    pending: VecDeque<u8>,
    silent: bool,
    drop_responses: usize,
    fail_writes: bool,
    fail_connect: bool,
    fail_discard: bool,
    connects: usize,
}

/// Scripted GMC device. Clones share the same script and event log.
#[derive(Debug, Clone)]
pub struct FakeConnector {
    script: Arc<Mutex<Script>>,
    log: EventLog,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                cpm: [0, 18],
                temperature: [21, 5, 0, 0],
                version: *b"GMC-320Re 4.22",
                pending: VecDeque::new(),
                silent: false,
                drop_responses: 0,
                fail_writes: false,
                fail_connect: false,
                fail_discard: false,
                connects: 0,
            })),
            log: EventLog::default(),
        }
    }

    pub fn log(&self) -> EventLog {
        Arc::clone(&self.log)
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.log.lock().unwrap().clear();
    }

    pub fn connects(&self) -> usize {
        self.script.lock().unwrap().connects
    }

    pub fn set_cpm(&self, response: [u8; 2]) {
        self.script.lock().unwrap().cpm = response;
    }

    pub fn set_temperature(&self, response: [u8; 4]) {
        self.script.lock().unwrap().temperature = response;
    }

    pub fn set_version(&self, response: [u8; 14]) {
        self.script.lock().unwrap().version = response;
    }

    /// Stop answering commands; reads time out.
    pub fn set_silent(&self, silent: bool) {
        self.script.lock().unwrap().silent = silent;
    }

    /// Swallow the responses to the next `count` commands.
    pub fn drop_next_responses(&self, count: usize) {
        self.script.lock().unwrap().drop_responses = count;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.script.lock().unwrap().fail_writes = fail;
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.script.lock().unwrap().fail_connect = fail;
    }

    pub fn set_fail_discard(&self, fail: bool) {
        self.script.lock().unwrap().fail_discard = fail;
    }

    /// Leave unread garbage in the receive buffer.
    pub fn push_stale(&self, bytes: &[u8]) {
        self.script.lock().unwrap().pending.extend(bytes);
    }

    fn record(&self, event: Event) {
        self.log.lock().unwrap().push(event);
    }
}

impl Connector for FakeConnector {
    type Link = FakeLink;

    fn endpoint(&self) -> &str {
        "fake"
    }

    fn connect(&self) -> Result<FakeLink, DeviceError> {
        self.record(Event::Connect);

        let mut script = self.script.lock().unwrap();
        if script.fail_connect {
            return Err(DeviceError::Open {
                port: "fake".to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such device"),
            });
        }
        script.connects += 1;
        script.pending.clear();

        Ok(FakeLink {
            connector: self.clone(),
        })
    }
}

pub struct FakeLink {
    connector: FakeConnector,
}

impl Write for FakeLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.connector
            .record(Event::Write(String::from_utf8_lossy(buf).into_owned()));

        let mut script = self.connector.script.lock().unwrap();
        if script.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"));
        }

        let response = if buf == Command::GetCpm.frame() {
            script.cpm.to_vec()
        } else if buf == Command::GetTemp.frame() {
            script.temperature.to_vec()
        } else if buf == Command::GetVer.frame() {
            script.version.to_vec()
        } else {
            Vec::new()
        };

        if response.is_empty() || script.silent {
            // no answer
        } else if script.drop_responses > 0 {
            script.drop_responses -= 1;
        } else {
            script.pending.extend(response);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for FakeLink {
    /// Hands out one byte per call, like a slow UART.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.connector.script.lock().unwrap().pending.pop_front() {
            Some(byte) => {
                buf[0] = byte;
                Ok(1)
            }
            None => Err(io::Error::new(io::ErrorKind::TimedOut, "operation timed out")),
        }
    }
}

impl Link for FakeLink {
    fn discard_input(&mut self) -> io::Result<()> {
        self.connector.record(Event::Discard);

        let mut script = self.connector.script.lock().unwrap();
        if script.fail_discard {
            return Err(io::Error::other("discard failed"));
        }
        script.pending.clear();
        Ok(())
    }
}

/// Publisher that records what it receives.
pub struct RecordingPublisher {
    name: &'static str,
    log: EventLog,
    readings: Arc<Mutex<Vec<Reading>>>,
    fail: bool,
    notify_after: Option<(usize, Arc<Notify>)>,
}

impl RecordingPublisher {
    pub fn new(name: &'static str, log: EventLog) -> Self {
        Self {
            name,
            log,
            readings: Arc::default(),
            fail: false,
            notify_after: None,
        }
    }

    pub fn failing(name: &'static str, log: EventLog) -> Self {
        Self {
            fail: true,
            ..Self::new(name, log)
        }
    }

    /// Wake `notify` once `count` readings have been published.
    pub fn notify_after(mut self, count: usize, notify: Arc<Notify>) -> Self {
        self.notify_after = Some((count, notify));
        self
    }

    pub fn readings(&self) -> Arc<Mutex<Vec<Reading>>> {
        Arc::clone(&self.readings)
    }
}

impl Publisher for RecordingPublisher {
    fn name(&self) -> &'static str {
        self.name
    }

    fn publish<'a>(&'a self, reading: &'a Reading) -> PublishFuture<'a> {
        Box::pin(async move {
            self.log.lock().unwrap().push(Event::Publish(self.name));

            let count = {
                let mut readings = self.readings.lock().unwrap();
                readings.push(reading.clone());
                readings.len()
            };
            if let Some((after, notify)) = &self.notify_after
                && count == *after
            {
                notify.notify_one();
            }

            if self.fail {
                return Err(PublishError::Status {
                    sink: self.name,
                    status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                });
            }
            Ok(())
        })
    }
}

/// A bound TCP port nobody accepts on. Pair with [`assert_no_connection`].
pub fn idle_endpoint() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    (listener, url)
}

pub fn assert_no_connection(listener: &TcpListener) {
    listener.set_nonblocking(true).unwrap();
    match listener.accept() {
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
        Err(err) => panic!("unexpected accept error: {err}"),
        Ok((_, peer)) => panic!("unexpected connection from {peer}"),
    }
}

/// HTTP server that answers exactly one request with an empty body.
pub struct OneShotServer {
    pub base_url: String,
    handle: thread::JoinHandle<String>,
}

impl OneShotServer {
    /// Wait for the request and return it as text (head and body).
    pub fn request(self) -> String {
        self.handle.join().unwrap()
    }
}

pub fn serve_once(status: &'static str) -> OneShotServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream);

        let mut request = String::new();
        let mut content_length = 0;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            if let Some((name, value)) = line.split_once(':')
                && name.eq_ignore_ascii_case("content-length")
            {
                content_length = value.trim().parse().unwrap();
            }
            request.push_str(&line);
            if line == "\r\n" || line.is_empty() {
                break;
            }
        }

        let mut body = vec![0; content_length];
        reader.read_exact(&mut body).unwrap();
        request.push_str(&String::from_utf8_lossy(&body));

        let mut stream = reader.into_inner();
        write!(
            stream,
            "HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        )
        .unwrap();
        request
    });

    OneShotServer { base_url, handle }
}

/// A TCP port with nothing listening on it.
pub fn closed_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// What a [`FakeBroker`] saw from its single client, after CONNECT.
#[derive(Debug, Clone, PartialEq)]
pub enum MqttPacket {
    Publish { topic: String, payload: Vec<u8> },
    Disconnect,
    Other(u8),
}

/// MQTT 3.1.1 broker that accepts one client, acknowledges its CONNECT and
/// records everything else until DISCONNECT or a quiet period.
pub struct FakeBroker {
    pub port: u16,
    handle: thread::JoinHandle<Vec<MqttPacket>>,
}

impl FakeBroker {
    /// Wait for the client to go away and return the recorded packets.
    pub fn packets(self) -> Vec<MqttPacket> {
        self.handle.join().unwrap()
    }
}

fn read_mqtt_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut header = [0u8; 1];
    stream.read_exact(&mut header).ok()?;

    let mut remaining = 0usize;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).ok()?;
        remaining |= usize::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
    }

    let mut body = vec![0; remaining];
    stream.read_exact(&mut body).ok()?;
    Some((header[0], body))
}

pub fn fake_broker() -> FakeBroker {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut packets = Vec::new();
        while let Some((header, body)) = read_mqtt_packet(&mut stream) {
            match header >> 4 {
                // CONNECT -> CONNACK, session not present, accepted
                1 => stream.write_all(&[0x20, 0x02, 0x00, 0x00]).unwrap(),
                3 => {
                    let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
                    let topic = String::from_utf8(body[2..2 + topic_len].to_vec()).unwrap();
                    let mut offset = 2 + topic_len;
                    // QoS 1 and 2 carry a packet id
                    if (header >> 1) & 0b11 != 0 {
                        offset += 2;
                    }
                    packets.push(MqttPacket::Publish {
                        topic,
                        payload: body[offset..].to_vec(),
                    });
                }
                14 => {
                    packets.push(MqttPacket::Disconnect);
                    break;
                }
                other => packets.push(MqttPacket::Other(other)),
            }
        }
        packets
    });

    FakeBroker { port, handle }
}
