use std::fmt;
use std::time::Duration;

use rmpv::Value;

use crate::WireError;

/// Short header keys used by every envelope.
pub mod header {
    pub const COMMAND: &str = "CMD";
    pub const TOKEN: &str = "TK";
    pub const ID: &str = "ID";
    pub const METHOD: &str = "MTH";
    pub const ARGS: &str = "ARG";
    pub const VALUE: &str = "VAL";
    pub const STATUS: &str = "STS";
    pub const LOCATION: &str = "LOC";
    pub const TIME: &str = "TIME";
    /// Compressed stream payload attached to read replies.
    pub const BUFFER: &str = "BUF";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Stream,
    User,
    Auth,
    Open,
    Close,
    Event,
    Execute,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "STRM",
            Self::User => "USER",
            Self::Auth => "AUTH",
            Self::Open => "OPEN",
            Self::Close => "CLSE",
            Self::Event => "EVT",
            Self::Execute => "EXE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "STRM" => Self::Stream,
            "USER" => Self::User,
            "AUTH" => Self::Auth,
            "OPEN" => Self::Open,
            "CLSE" => Self::Close,
            "EVT" => Self::Event,
            "EXE" => Self::Execute,
            _ => return None,
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// `VAL` holds a plain value.
    Ok,
    /// `VAL` holds an error message.
    Error,
    Void,
    /// `VAL` holds the token of a freshly provided remote stream.
    StreamRef,
    /// `VAL` holds the token of a new session.
    ServiceRef,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Error => "EX",
            Self::Void => "VD",
            Self::StreamRef => "SR",
            Self::ServiceRef => "OP",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "OK" => Self::Ok,
            "EX" => Self::Error,
            "VD" => Self::Void,
            "SR" => Self::StreamRef,
            "OP" => Self::ServiceRef,
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered header map. Keys keep insertion order on the wire; setting an
/// existing key replaces its value in place.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    headers: Vec<(String, Value)>,
}

impl Message {
    /// Empty envelope, used for replies.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_command(command: Command) -> Self {
        Self::new().with_command(command)
    }

    pub fn from_value(value: Value) -> Result<Self, WireError> {
        let Value::Map(entries) = value else {
            return Err(WireError::malformed("envelope is not a map"));
        };
        let mut headers = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match key {
                Value::String(key) => match key.into_str() {
                    Some(key) => headers.push((key, value)),
                    None => return Err(WireError::malformed("header key is not valid utf-8")),
                },
                other => {
                    return Err(WireError::malformed(format!("header key {other} is not a string")))
                }
            }
        }
        Ok(Self { headers })
    }

    pub fn to_value(&self) -> Value {
        Value::Map(
            self.headers
                .iter()
                .map(|(key, value)| (Value::from(key.as_str()), value.clone()))
                .collect(),
        )
    }

    pub fn into_value(self) -> Value {
        Value::Map(
            self.headers.into_iter().map(|(key, value)| (Value::from(key), value)).collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.headers.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.headers.push((key.to_string(), value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let index = self.headers.iter().position(|(k, _)| k == key)?;
        Some(self.headers.remove(index).1)
    }

    fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Raw command header, including values this side does not recognise.
    pub fn command_raw(&self) -> Option<&str> {
        self.get_str(header::COMMAND)
    }

    pub fn command(&self) -> Option<Command> {
        self.command_raw().and_then(Command::parse)
    }

    pub fn token(&self) -> Option<&str> {
        self.get_str(header::TOKEN)
    }

    pub fn id(&self) -> Option<u32> {
        self.get(header::ID).and_then(Value::as_u64).and_then(|id| u32::try_from(id).ok())
    }

    pub fn method(&self) -> Option<&str> {
        self.get_str(header::METHOD)
    }

    pub fn args(&self) -> Option<&[Value]> {
        self.get(header::ARGS).and_then(Value::as_array).map(Vec::as_slice)
    }

    pub fn value(&self) -> Option<&Value> {
        self.get(header::VALUE)
    }

    pub fn status_raw(&self) -> Option<&str> {
        self.get_str(header::STATUS)
    }

    pub fn status(&self) -> Option<Status> {
        self.status_raw().and_then(Status::parse)
    }

    pub fn location(&self) -> Option<&str> {
        self.get_str(header::LOCATION)
    }

    /// Server-side execution time carried in `TIME` (milliseconds as f64).
    pub fn elapsed(&self) -> Option<Duration> {
        let millis = self.get(header::TIME).and_then(Value::as_f64)?;
        if millis.is_finite() && millis >= 0.0 {
            Some(Duration::from_secs_f64(millis / 1000.0))
        } else {
            None
        }
    }

    pub fn set_command(&mut self, command: Command) {
        self.set(header::COMMAND, command.as_str());
    }

    pub fn set_token(&mut self, token: &str) {
        self.set(header::TOKEN, token);
    }

    pub fn set_id(&mut self, id: u32) {
        self.set(header::ID, id);
    }

    pub fn set_status(&mut self, status: Status) {
        self.set(header::STATUS, status.as_str());
    }

    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.set(header::TIME, Value::F64(elapsed.as_secs_f64() * 1000.0));
    }

    pub fn with_command(mut self, command: Command) -> Self {
        self.set_command(command);
        self
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.set_token(token);
        self
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.set_id(id);
        self
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.set(header::METHOD, method);
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.set(header::ARGS, Value::Array(args));
        self
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.set(header::VALUE, value);
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.set_status(status);
        self
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.set(header::LOCATION, location);
        self
    }

    /// `STS=EX` reply carrying `message` as its value.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new().with_status(Status::Error).with_value(message.into())
    }
}
