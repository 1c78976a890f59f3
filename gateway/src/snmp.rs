//! SNMP execution with bounded retries.
//!
//! [`SnmpExecutor`] owns the retry policy and drives one [`SnmpTransport`].
//! The production transport is [`AgentClient`], built on `async-snmp` and
//! keeping one session per device; tests plug in a recording agent instead.

use crate::config::RetryConf;
use crate::error::ConfigError;
use crate::registry::{
    AuthProtocol, Community, DeviceDescriptor, DeviceId, PowerValue, PrivProtocol, SnmpAuth,
    UsmUser,
};
use async_snmp::{Auth, Client, ErrorKind, Oid, Retry, UdpClient, UdpTransport, UsmConfig, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_conf(conf: &RetryConf) -> Result<Self, ConfigError> {
        if conf.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        Ok(Self {
            max_attempts: conf.max_attempts,
            delay: Duration::from_secs(conf.delay),
            timeout: Duration::from_secs(conf.timeout),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnmpOp {
    Get,
    Set(PowerValue),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnmpRequest {
    pub oid: String,
    pub op: SnmpOp,
}

impl SnmpRequest {
    pub fn get(oid: impl Into<String>) -> Self {
        Self { oid: oid.into(), op: SnmpOp::Get }
    }

    pub fn set(oid: impl Into<String>, value: PowerValue) -> Self {
        Self { oid: oid.into(), op: SnmpOp::Set(value) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnmpResponse {
    pub oid: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnmpError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("agent error: {0}")]
    Agent(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid OID '{0}'")]
    InvalidOid(String),
}

impl SnmpError {
    fn is_retryable(&self) -> bool {
        !matches!(self, SnmpError::InvalidOid(_))
    }
}

/// Every attempt failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("gave up after {attempts} attempt(s): {last_cause}")]
pub struct SnmpFailure {
    pub attempts: u32,
    pub last_cause: SnmpError,
}

/// One request/response exchange with an agent, no retries
pub trait SnmpTransport: Send + Sync + 'static {
    fn exchange(
        &self,
        device: &DeviceDescriptor,
        request: &SnmpRequest,
    ) -> impl Future<Output = Result<SnmpResponse, SnmpError>> + Send;
}

/// Which community a v1/v2c session speaks with; v3 uses one user for both
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Role {
    Read,
    Write,
    Usm,
}

/// Credentials one exchange goes out with
#[derive(Debug, PartialEq, Eq)]
enum Credentials<'a> {
    V1(&'a str),
    V2c(&'a str),
    Usm(&'a UsmUser),
}

impl Credentials<'_> {
    fn role(&self, op: SnmpOp) -> Role {
        match (self, op) {
            (Credentials::Usm(_), _) => Role::Usm,
            (_, SnmpOp::Get) => Role::Read,
            (_, SnmpOp::Set(_)) => Role::Write,
        }
    }
}

/// GET reads with the public community, SET writes with the private one
fn credentials(auth: &SnmpAuth, op: SnmpOp) -> Credentials<'_> {
    match auth {
        SnmpAuth::V1(c) => Credentials::V1(community(c, op)),
        SnmpAuth::V2(c) => Credentials::V2c(community(c, op)),
        SnmpAuth::V3(user) => Credentials::Usm(user),
    }
}

fn community(c: &Community, op: SnmpOp) -> &str {
    match op {
        SnmpOp::Get => &c.read,
        SnmpOp::Set(_) => &c.write,
    }
}

struct Session {
    target: SocketAddr,
    auth: SnmpAuth,
    client: Arc<UdpClient>,
}

impl Session {
    fn serves(&self, device: &DeviceDescriptor) -> bool {
        self.target == device.transport && self.auth == device.auth
    }
}

/// `async-snmp` clients over one shared UDP socket.
///
/// Sessions are kept per device and role so v3 engine discovery happens
/// once, not on every attempt. A session whose endpoint or credentials no
/// longer match the descriptor (after a reload) is rebuilt; one that hit a
/// transport error is dropped.
pub struct AgentClient {
    socket: UdpTransport,
    timeout: Duration,
    sessions: Mutex<HashMap<(DeviceId, Role), Session>>,
}

impl AgentClient {
    pub async fn bind(timeout: Duration) -> Result<Self, SnmpError> {
        let socket = UdpTransport::bind("0.0.0.0:0").await.map_err(classify)?;
        Ok(Self { socket, timeout, sessions: Mutex::new(HashMap::new()) })
    }

    fn cached(&self, device: &DeviceDescriptor, role: Role) -> Option<Arc<UdpClient>> {
        self.sessions
            .lock()
            .get(&(device.id, role))
            .filter(|session| session.serves(device))
            .map(|session| Arc::clone(&session.client))
    }

    async fn session(&self, device: &DeviceDescriptor, op: SnmpOp) -> Result<Arc<UdpClient>, SnmpError> {
        let creds = credentials(&device.auth, op);
        let role = creds.role(op);
        if let Some(client) = self.cached(device, role) {
            return Ok(client);
        }

        let client = Client::builder(device.transport, client_auth(&creds)?)
            .request_timeout(self.timeout)
            .retry(Retry::none())
            .build_with(&self.socket)
            .await
            .map_err(classify)?;
        let client = Arc::new(client);
        debug!(device = device.id, role = ?role, target = %device.transport, "snmp session opened");

        let session = Session { target: device.transport, auth: device.auth.clone(), client: Arc::clone(&client) };
        self.sessions.lock().insert((device.id, role), session);
        Ok(client)
    }

    fn forget(&self, device: &DeviceDescriptor, op: SnmpOp) {
        let role = credentials(&device.auth, op).role(op);
        self.sessions.lock().remove(&(device.id, role));
    }
}

impl SnmpTransport for AgentClient {
    async fn exchange(
        &self,
        device: &DeviceDescriptor,
        request: &SnmpRequest,
    ) -> Result<SnmpResponse, SnmpError> {
        let oid = Oid::parse(&request.oid).map_err(|_| SnmpError::InvalidOid(request.oid.clone()))?;
        let client = self.session(device, request.op).await?;

        let outcome = match request.op {
            SnmpOp::Get => client.get(&oid).await,
            SnmpOp::Set(value) => client.set(&oid, Value::Integer(value.0)).await,
        };

        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                let err = classify(err);
                if matches!(err, SnmpError::Transport(_)) {
                    self.forget(device, request.op);
                }
                return Err(err);
            }
        };
        let varbind = response
            .single()
            .ok_or_else(|| SnmpError::Agent(format!("expected one varbind, got {}", response.varbinds.len())))?;
        Ok(SnmpResponse { oid: request.oid.clone(), value: varbind.value.to_string() })
    }
}

fn client_auth(creds: &Credentials<'_>) -> Result<Auth, SnmpError> {
    match creds {
        Credentials::V1(community) => Ok(Auth::v1(community.to_string())),
        Credentials::V2c(community) => Ok(Auth::v2c(community.to_string())),
        Credentials::Usm(user) => usm_auth(user),
    }
}

fn auth_protocol(protocol: AuthProtocol) -> async_snmp::AuthProtocol {
    match protocol {
        AuthProtocol::Md5 => async_snmp::AuthProtocol::Md5,
        AuthProtocol::Sha1 => async_snmp::AuthProtocol::Sha1,
        AuthProtocol::Sha256 => async_snmp::AuthProtocol::Sha256,
        AuthProtocol::Sha512 => async_snmp::AuthProtocol::Sha512,
    }
}

/// AES-256 keys are extended the Blumenthal way, as net-snmp does
fn priv_protocol(protocol: PrivProtocol) -> async_snmp::PrivProtocol {
    match protocol {
        PrivProtocol::Aes128 => async_snmp::PrivProtocol::Aes128,
        PrivProtocol::Aes256 => async_snmp::PrivProtocol::Aes256Blumenthal,
    }
}

fn usm_auth(user: &UsmUser) -> Result<Auth, SnmpError> {
    let config = UsmConfig::new(user.user.clone());
    let config = match (&user.auth, &user.privacy) {
        (Some(auth), Some(privacy)) => config.auth_priv(
            auth_protocol(auth.protocol),
            &auth.passphrase,
            priv_protocol(privacy.protocol),
            &privacy.passphrase,
        ),
        (Some(auth), None) => config.auth(auth_protocol(auth.protocol), &auth.passphrase),
        (None, _) => Ok(config),
    }
    .map_err(|e| SnmpError::Transport(format!("usm user '{}': {e}", user.user)))?;
    Ok(config.into())
}

fn classify(err: Box<async_snmp::Error>) -> SnmpError {
    match err.kind() {
        ErrorKind::Timeout | ErrorKind::ConstructionTimeout => SnmpError::Timeout(Duration::ZERO),
        ErrorKind::Snmp | ErrorKind::Report | ErrorKind::Auth => SnmpError::Agent(err.to_string()),
        _ => SnmpError::Transport(err.to_string()),
    }
}

/// Runs single exchanges under the process-wide [`RetryPolicy`]
#[derive(Debug)]
pub struct SnmpExecutor<T> {
    transport: T,
    policy: RetryPolicy,
}

impl<T: SnmpTransport> SnmpExecutor<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// First success wins; a completed exchange is never retried.
    ///
    /// Worst case takes `max_attempts * timeout + (max_attempts - 1) * delay`.
    pub async fn execute(
        &self,
        device: &DeviceDescriptor,
        request: &SnmpRequest,
    ) -> Result<SnmpResponse, SnmpFailure> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let exchange = self.transport.exchange(device, request);
            let cause = match tokio::time::timeout(self.policy.timeout, exchange).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(SnmpError::Timeout(_))) | Err(_) => SnmpError::Timeout(self.policy.timeout),
                Ok(Err(err)) => err,
            };

            debug!(
                device = device.id,
                oid = %request.oid,
                attempt = attempts,
                max_attempts = self.policy.max_attempts,
                cause = %cause,
                "snmp attempt failed"
            );

            if attempts >= self.policy.max_attempts || !cause.is_retryable() {
                return Err(SnmpFailure { attempts, last_cause: cause });
            }
            tokio::time::sleep(self.policy.delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PowerValues, SecurityLevel, UsmKey};
    use std::collections::{BTreeMap, VecDeque};
    use tokio::time::Instant;

    enum Reply {
        Ok(&'static str),
        Fail(SnmpError),
        Hang,
    }

    /// Plays back canned replies; once exhausted, hangs forever
    struct Scripted {
        replies: Mutex<VecDeque<Reply>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl Scripted {
        fn new(replies: Vec<Reply>) -> Self {
            Self { replies: Mutex::new(replies.into()), calls: Mutex::new(Vec::new()) }
        }
    }

    impl SnmpTransport for Scripted {
        async fn exchange(
            &self,
            _device: &DeviceDescriptor,
            request: &SnmpRequest,
        ) -> Result<SnmpResponse, SnmpError> {
            self.calls.lock().push(Instant::now());
            let reply = self.replies.lock().pop_front().unwrap_or(Reply::Hang);
            match reply {
                Reply::Ok(value) => Ok(SnmpResponse { oid: request.oid.clone(), value: value.into() }),
                Reply::Fail(err) => Err(err),
                Reply::Hang => std::future::pending().await,
            }
        }
    }

    fn device() -> DeviceDescriptor {
        DeviceDescriptor {
            id: 7,
            name: "007".into(),
            transport: "127.0.0.1:161".parse().unwrap(),
            auth: SnmpAuth::V1(Community { read: "public".into(), write: "private".into() }),
            outlets: BTreeMap::from([(1, "1.3.6.1.4.1.1".to_string())]),
            power_values: PowerValues { on: PowerValue(2), off: PowerValue(1), cycle: None },
            cycle_delay: Duration::from_secs(5),
            healthcheck_oid: "1.3.6.1.4.1.1".into(),
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::from_secs(2),
            timeout: Duration::from_secs(3),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_failure_uses_every_attempt() {
        let executor = SnmpExecutor::new(Scripted::new(vec![]), policy(3));
        let started = Instant::now();

        let failure = executor.execute(&device(), &SnmpRequest::get("1.3.6.1.4.1.1")).await.unwrap_err();

        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.last_cause, SnmpError::Timeout(Duration::from_secs(3)));
        // 3 x timeout + 2 x delay
        assert_eq!(started.elapsed(), Duration::from_secs(13));
        assert_eq!(executor.transport().calls.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_error_then_success() {
        let transport = Scripted::new(vec![
            Reply::Fail(SnmpError::Agent("genErr".into())),
            Reply::Ok("2"),
        ]);
        let executor = SnmpExecutor::new(transport, policy(3));

        let response = executor
            .execute(&device(), &SnmpRequest::set("1.3.6.1.4.1.1", PowerValue(2)))
            .await
            .unwrap();

        assert_eq!(response.value, "2");
        let calls = executor.transport().calls.lock().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1] - calls[0], Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_is_not_retried() {
        let executor = SnmpExecutor::new(Scripted::new(vec![Reply::Ok("0")]), policy(3));
        executor.execute(&device(), &SnmpRequest::get("1.3.6.1.4.1.1")).await.unwrap();
        assert_eq!(executor.transport().calls.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_oid_not_retried() {
        let transport = Scripted::new(vec![Reply::Fail(SnmpError::InvalidOid("x".into()))]);
        let executor = SnmpExecutor::new(transport, policy(3));
        let failure = executor.execute(&device(), &SnmpRequest::get("x")).await.unwrap_err();
        assert_eq!(failure.attempts, 1);
    }

    fn usm_user(level: SecurityLevel, privacy: bool) -> UsmUser {
        UsmUser {
            user: "admin".into(),
            level,
            auth: Some(UsmKey { protocol: AuthProtocol::Sha256, passphrase: "authpass".into() }),
            privacy: privacy
                .then(|| UsmKey { protocol: PrivProtocol::Aes256, passphrase: "privpass".into() }),
        }
    }

    #[test]
    fn test_communities_follow_operation() {
        let community = Community { read: "public".into(), write: "private".into() };
        let set = SnmpOp::Set(PowerValue(1));

        let v1 = SnmpAuth::V1(community.clone());
        assert_eq!(credentials(&v1, SnmpOp::Get), Credentials::V1("public"));
        assert_eq!(credentials(&v1, set), Credentials::V1("private"));

        let v2 = SnmpAuth::V2(community);
        let get = credentials(&v2, SnmpOp::Get);
        assert_eq!(get, Credentials::V2c("public"));
        assert_eq!(credentials(&v2, set), Credentials::V2c("private"));
        assert_eq!(get.role(SnmpOp::Get), Role::Read);
        assert_eq!(credentials(&v2, set).role(set), Role::Write);
    }

    #[test]
    fn test_v3_uses_one_user_for_both_operations() {
        let auth = SnmpAuth::V3(usm_user(SecurityLevel::AuthPriv, true));
        let get = credentials(&auth, SnmpOp::Get);
        let set = credentials(&auth, SnmpOp::Set(PowerValue(2)));

        assert_eq!(get, set);
        assert!(matches!(get, Credentials::Usm(user) if user.user == "admin"));
        assert_eq!(get.role(SnmpOp::Get), Role::Usm);
        assert_eq!(set.role(SnmpOp::Set(PowerValue(2))), Role::Usm);
    }

    #[test]
    fn test_usm_protocols_map_to_client() {
        assert!(matches!(auth_protocol(AuthProtocol::Md5), async_snmp::AuthProtocol::Md5));
        assert!(matches!(auth_protocol(AuthProtocol::Sha1), async_snmp::AuthProtocol::Sha1));
        assert!(matches!(auth_protocol(AuthProtocol::Sha256), async_snmp::AuthProtocol::Sha256));
        assert!(matches!(auth_protocol(AuthProtocol::Sha512), async_snmp::AuthProtocol::Sha512));
        assert!(matches!(priv_protocol(PrivProtocol::Aes128), async_snmp::PrivProtocol::Aes128));
        assert!(matches!(priv_protocol(PrivProtocol::Aes256), async_snmp::PrivProtocol::Aes256Blumenthal));
    }

    #[tokio::test]
    async fn test_sessions_reused_until_descriptor_changes() {
        let client = AgentClient::bind(Duration::from_secs(1)).await.unwrap();
        let mut dev = device();

        let read = client.session(&dev, SnmpOp::Get).await.unwrap();
        let again = client.session(&dev, SnmpOp::Get).await.unwrap();
        assert!(Arc::ptr_eq(&read, &again));
        let write = client.session(&dev, SnmpOp::Set(PowerValue(1))).await.unwrap();
        assert!(!Arc::ptr_eq(&read, &write));
        assert_eq!(client.sessions.lock().len(), 2);

        // reload moved the device
        dev.transport = "127.0.0.2:161".parse().unwrap();
        let moved = client.session(&dev, SnmpOp::Get).await.unwrap();
        assert!(!Arc::ptr_eq(&read, &moved));
        assert_eq!(client.sessions.lock().len(), 2);

        client.forget(&dev, SnmpOp::Get);
        assert_eq!(client.sessions.lock().len(), 1);
    }

    #[test]
    fn test_usm_credentials_follow_security_level() {
        assert!(usm_auth(&usm_user(SecurityLevel::AuthPriv, true)).is_ok());
        assert!(usm_auth(&usm_user(SecurityLevel::AuthNoPriv, false)).is_ok());
        let anonymous = UsmUser { auth: None, privacy: None, ..usm_user(SecurityLevel::NoAuthNoPriv, false) };
        assert!(usm_auth(&anonymous).is_ok());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let conf = RetryConf { max_attempts: 0, delay: 1, timeout: 1 };
        assert!(matches!(RetryPolicy::from_conf(&conf), Err(ConfigError::NoAttempts)));
    }
}
