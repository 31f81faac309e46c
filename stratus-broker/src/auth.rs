use std::{
    collections::HashMap,
    convert::Infallible,
    error::Error as StdError,
    fmt::{Display, Formatter, Result as FmtResult},
    fs,
    net::SocketAddr,
    path::Path,
    sync::Arc,
};

use bytes::Bytes;

use crate::settings::AuthSettings;
use crate::{ClientId, InitializeBrokerError};

/// Authenticated MQTT client identity.
#[derive(Clone, Debug, PartialEq)]
pub enum AuthId {
    /// Identity for anonymous client.
    Anonymous,

    /// Identity for non-anonymous client.
    Identity(Identity),
}

impl AuthId {
    pub fn as_str(&self) -> &str {
        match self {
            AuthId::Anonymous => "*",
            AuthId::Identity(identity) => identity.as_str(),
        }
    }
}

impl Display for AuthId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

impl<T: Into<Identity>> From<T> for AuthId {
    fn from(identity: T) -> Self {
        AuthId::Identity(identity.into())
    }
}

/// Non-anonymous client identity.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Identity(Arc<str>);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T: AsRef<str>> From<T> for Identity {
    fn from(identity: T) -> Self {
        Self(identity.as_ref().into())
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

/// DER-encoded client certificate presented during the TLS handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct Certificate(Vec<u8>);

impl Certificate {
    pub fn as_der(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Certificate {
    fn from(der: Vec<u8>) -> Self {
        Self(der)
    }
}

/// Everything known about a client at CONNECT time that an authenticator can
/// base its decision on.
#[derive(Debug)]
pub struct AuthenticationContext {
    client_id: ClientId,
    peer_addr: SocketAddr,
    username: Option<String>,
    password: Option<Bytes>,
    certificate: Option<Certificate>,
}

impl AuthenticationContext {
    pub fn new(client_id: ClientId, peer_addr: SocketAddr) -> Self {
        Self {
            client_id,
            peer_addr,
            username: None,
            password: None,
            certificate: None,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<Bytes>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_certificate(mut self, certificate: Certificate) -> Self {
        self.certificate = Some(certificate);
        self
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&Bytes> {
        self.password.as_ref()
    }

    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }
}

/// Outcome of an authentication attempt. The two refusal variants map to the
/// CONNACK return codes 0x04 (bad user name or password) and 0x05 (not
/// authorized).
#[derive(Clone, Debug, PartialEq)]
pub enum Authentication {
    Accepted(AuthId),
    BadCredentials,
    NotAuthorized,
}

/// A trait to authenticate a MQTT client with given credentials.
pub trait Authenticator {
    /// Authentication error.
    type Error: StdError + Send + Sync + 'static;

    /// Authenticates a MQTT client with given credentials.
    fn authenticate(&self, context: AuthenticationContext) -> Result<Authentication, Self::Error>;
}

impl<F, E> Authenticator for F
where
    F: Fn(AuthenticationContext) -> Result<Authentication, E>,
    E: StdError + Send + Sync + 'static,
{
    type Error = E;

    fn authenticate(&self, context: AuthenticationContext) -> Result<Authentication, Self::Error> {
        self(context)
    }
}

/// Authenticator that accepts any client as anonymous. Used when the `auth`
/// config section is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAuthenticator;

impl Authenticator for DefaultAuthenticator {
    type Error = Infallible;

    fn authenticate(&self, _: AuthenticationContext) -> Result<Authentication, Self::Error> {
        Ok(Authentication::Accepted(AuthId::Anonymous))
    }
}

/// Credential-policy authenticator driven by the `auth` config section.
///
/// Username/password pairs come from a `user:password`-per-line file.
#[derive(Debug, Clone)]
pub struct PasswordFileAuthenticator {
    enabled: bool,
    allow_anonymous: bool,
    require_client_certs: bool,
    credentials: HashMap<String, String>,
}

impl PasswordFileAuthenticator {
    pub fn from_settings(settings: &AuthSettings) -> Result<Self, InitializeBrokerError> {
        let credentials = match settings.username_password_file() {
            Some(path) if settings.enabled() => load_password_file(path)?,
            _ => HashMap::new(),
        };

        Ok(Self {
            enabled: settings.enabled(),
            allow_anonymous: settings.allow_anonymous(),
            require_client_certs: settings.require_client_certs(),
            credentials,
        })
    }
}

impl Authenticator for PasswordFileAuthenticator {
    type Error = Infallible;

    fn authenticate(&self, context: AuthenticationContext) -> Result<Authentication, Self::Error> {
        if !self.enabled {
            return Ok(Authentication::Accepted(AuthId::Anonymous));
        }

        if self.require_client_certs && context.certificate().is_none() {
            return Ok(Authentication::NotAuthorized);
        }

        let username = match context.username() {
            Some(username) => username,
            None if self.allow_anonymous => {
                return Ok(Authentication::Accepted(AuthId::Anonymous));
            }
            None => return Ok(Authentication::NotAuthorized),
        };

        let matches = self
            .credentials
            .get(username)
            .map(|expected| {
                context
                    .password()
                    .map(|password| password.as_ref() == expected.as_bytes())
                    .unwrap_or(false)
            })
            .unwrap_or(false);

        if matches {
            Ok(Authentication::Accepted(username.into()))
        } else {
            Ok(Authentication::BadCredentials)
        }
    }
}

fn load_password_file(path: &Path) -> Result<HashMap<String, String>, InitializeBrokerError> {
    let contents = fs::read_to_string(path)
        .map_err(|e| InitializeBrokerError::LoadPasswordFile(path.to_path_buf(), e))?;

    let mut credentials = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((username, password)) = split_credential(line) {
            credentials.insert(username.to_string(), password.to_string());
        }
    }
    Ok(credentials)
}

fn split_credential(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.splitn(2, ':');
    let username = parts.next()?;
    let password = parts.next()?;
    Some((username, password))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::tests::peer_addr;

    fn authenticator(contents: &str, allow_anonymous: bool) -> PasswordFileAuthenticator {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();

        let settings = AuthSettings::new(
            true,
            allow_anonymous,
            false,
            Some(file.path().to_path_buf()),
        );
        PasswordFileAuthenticator::from_settings(&settings).unwrap()
    }

    #[test]
    fn accepts_known_credentials() {
        let authenticator = authenticator("alice:wonderland\n# comment\nbob:builder\n", false);

        let context = AuthenticationContext::new("client-1".into(), peer_addr())
            .with_username("alice")
            .with_password(&b"wonderland"[..]);

        assert_eq!(
            authenticator.authenticate(context).unwrap(),
            Authentication::Accepted("alice".into())
        );
    }

    #[test]
    fn refuses_wrong_password() {
        let authenticator = authenticator("alice:wonderland\n", false);

        let context = AuthenticationContext::new("client-1".into(), peer_addr())
            .with_username("alice")
            .with_password(&b"nope"[..]);

        assert_eq!(
            authenticator.authenticate(context).unwrap(),
            Authentication::BadCredentials
        );
    }

    #[test]
    fn refuses_unknown_user() {
        let authenticator = authenticator("alice:wonderland\n", false);

        let context = AuthenticationContext::new("client-1".into(), peer_addr())
            .with_username("mallory")
            .with_password(&b"wonderland"[..]);

        assert_eq!(
            authenticator.authenticate(context).unwrap(),
            Authentication::BadCredentials
        );
    }

    #[test]
    fn anonymous_policy() {
        let anon_authenticator = authenticator("alice:wonderland\n", true);
        let context = AuthenticationContext::new("client-1".into(), peer_addr());
        assert_eq!(
            anon_authenticator.authenticate(context).unwrap(),
            Authentication::Accepted(AuthId::Anonymous)
        );

        let authenticator = authenticator("alice:wonderland\n", false);
        let context = AuthenticationContext::new("client-1".into(), peer_addr());
        assert_eq!(
            authenticator.authenticate(context).unwrap(),
            Authentication::NotAuthorized
        );
    }

    #[test]
    fn disabled_auth_accepts_everyone() {
        let settings = AuthSettings::new(false, false, false, None);
        let authenticator = PasswordFileAuthenticator::from_settings(&settings).unwrap();

        let context = AuthenticationContext::new("client-1".into(), peer_addr());
        assert_eq!(
            authenticator.authenticate(context).unwrap(),
            Authentication::Accepted(AuthId::Anonymous)
        );
    }

    #[test]
    fn requires_client_certificate() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"alice:wonderland\n").unwrap();

        let settings = AuthSettings::new(true, true, true, Some(file.path().to_path_buf()));
        let authenticator = PasswordFileAuthenticator::from_settings(&settings).unwrap();

        let context = AuthenticationContext::new("client-1".into(), peer_addr());
        assert_eq!(
            authenticator.authenticate(context).unwrap(),
            Authentication::NotAuthorized
        );

        let context = AuthenticationContext::new("client-1".into(), peer_addr())
            .with_certificate(Certificate::from(vec![0x30, 0x82]));
        assert_eq!(
            authenticator.authenticate(context).unwrap(),
            Authentication::Accepted(AuthId::Anonymous)
        );
    }
}
