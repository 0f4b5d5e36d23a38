//! Method-call dispatch: lets a UI layer drive a [`Session`] by method name and a JSON argument map.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::EndpointId;
use crate::session::{Session, SessionError};

/// A named operation with its arguments, e.g. `{"method":"sendMessage","args":{"endpointId":"E1","message":"hi"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl MethodCall {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: Map::new(),
        }
    }

    pub fn arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_owned(), value.into());
        self
    }
}

/// Wire form of a dispatch outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodReply {
    Result(Value),
    Error { code: String, message: String },
}

impl From<Result<Value, SessionError>> for MethodReply {
    fn from(r: Result<Value, SessionError>) -> Self {
        match r {
            Ok(v) => MethodReply::Result(v),
            Err(e) => MethodReply::Error {
                code: e.code().to_owned(),
                message: e.to_string(),
            },
        }
    }
}

fn str_arg<'a>(args: &'a Map<String, Value>, key: &'static str) -> Result<&'a str, SessionError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or(SessionError::ArgumentMissing(key))
}

fn opt_str_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn bool_arg(args: &Map<String, Value>, key: &'static str) -> Result<bool, SessionError> {
    args.get(key)
        .and_then(Value::as_bool)
        .ok_or(SessionError::ArgumentMissing(key))
}

impl Session {
    /// Run one method call. Unknown methods fail with [`SessionError::UnknownOperation`].
    pub async fn dispatch(&self, call: &MethodCall) -> Result<Value, SessionError> {
        let args = &call.args;
        tracing::debug!(method = %call.method, "dispatch");
        match call.method.as_str() {
            "startDiscovery" => {
                self.start_discovery(opt_str_arg(args, "username")).await?;
                Ok(Value::Null)
            }
            "startAdvertising" => {
                self.start_advertising(opt_str_arg(args, "username"))
                    .await?;
                Ok(Value::Null)
            }
            "connectToEndpoint" => {
                let id = EndpointId::from(str_arg(args, "endpointId")?);
                self.connect(&id).await?;
                Ok(Value::from("Connection request sent."))
            }
            "sendMessage" => {
                let message = str_arg(args, "message")?;
                let id = EndpointId::from(str_arg(args, "endpointId")?);
                self.send(&id, message).await?;
                Ok(Value::from("Message sent."))
            }
            "sendTypingStatus" => {
                let is_typing = bool_arg(args, "isTyping")?;
                let id = EndpointId::from(str_arg(args, "endpointId")?);
                self.send_typing(&id, is_typing).await?;
                Ok(Value::from("Typing status sent."))
            }
            "sendReadReceipt" => {
                let message_id = str_arg(args, "messageId")?;
                let id = EndpointId::from(str_arg(args, "endpointId")?);
                self.send_read_receipt(&id, message_id).await?;
                Ok(Value::from("Read receipt sent."))
            }
            "stopAllEndpoints" => {
                self.stop_all().await?;
                Ok(Value::from("Stopped all endpoints"))
            }
            other => Err(SessionError::UnknownOperation(other.to_owned())),
        }
    }
}
