// Application-supplied authentication and authorization hooks.
use crate::channel::Channel;
use async_trait::async_trait;
use std::collections::HashMap;

/// Access kind checked on SEND ("write") and SUBSCRIBE ("read").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl Access {
    pub fn as_str(&self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
        }
    }
}

/// Hooks the host application plugs into the broker.
///
/// `authenticate` runs on CONNECT/STOMP; entries written into `metadata`
/// are echoed back on the CONNECTED frame prefixed `connectionMetadata-`
/// and kept on the connection. `authorize` runs per SEND/SUBSCRIBE with
/// the parsed exchange and tail.
#[async_trait]
pub trait AuthHandler: Send + Sync {
    async fn authenticate(
        &self,
        login: Option<&str>,
        passcode: Option<&str>,
        host: Option<&str>,
        channel: &Channel,
        metadata: &mut HashMap<String, String>,
    ) -> bool;

    async fn authorize(
        &self,
        login: Option<&str>,
        exchange: &str,
        destination: &str,
        access: Access,
        channel: &Channel,
    ) -> bool;
}

/// Default hook: every client may connect, publish, and subscribe.
#[derive(Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl AuthHandler for AllowAll {
    async fn authenticate(
        &self,
        _login: Option<&str>,
        _passcode: Option<&str>,
        _host: Option<&str>,
        _channel: &Channel,
        _metadata: &mut HashMap<String, String>,
    ) -> bool {
        true
    }

    async fn authorize(
        &self,
        _login: Option<&str>,
        _exchange: &str,
        _destination: &str,
        _access: Access,
        _channel: &Channel,
    ) -> bool {
        true
    }
}
