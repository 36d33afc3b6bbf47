//! Authentication negotiation.
//!
//! The server drives the exchange: every Authentication request is answered
//! with at most one frame. The password is only resolved when a request
//! actually needs it.

use bytes::Bytes;

use super::config::PasswordProvider;
use super::error::{PgError, PgResult};
use super::protocol::{
    auth_type_name, BackendMessage, FrameBuilder, FrontendMessage, PasswordMessage,
    SaslInitialResponseMessage, SaslResponseMessage,
};
use super::scram::{ScramClient, SCRAM_SHA_256};

/// Where the password comes from.
#[derive(Clone, Default)]
pub enum PasswordSource {
    #[default]
    None,
    Static(String),
    Provider(PasswordProvider),
}

/// Outcome of feeding one Authentication message to the negotiator.
#[derive(Debug)]
pub enum AuthStep {
    /// Send this frame and wait for the next request.
    Respond(Bytes),
    /// AuthenticationOk; startup continues with parameters and key data.
    Done,
}

/// Authentication state machine for one startup.
pub struct Authenticator {
    user: String,
    source: PasswordSource,
    resolved: Option<String>,
    scram: Option<ScramClient>,
    frame: FrameBuilder,
}

impl Authenticator {
    pub fn new(user: &str, source: PasswordSource) -> Self {
        Self {
            user: user.to_string(),
            source,
            resolved: None,
            scram: None,
            frame: FrameBuilder::new(),
        }
    }

    async fn password(&mut self) -> PgResult<String> {
        if let Some(ref password) = self.resolved {
            return Ok(password.clone());
        }
        let password = match &self.source {
            PasswordSource::None => {
                return Err(PgError::Auth("Password required".to_string()));
            }
            PasswordSource::Static(password) => password.clone(),
            PasswordSource::Provider(provider) => provider().await?,
        };
        self.resolved = Some(password.clone());
        Ok(password)
    }

    /// Answer one Authentication request.
    pub async fn step(&mut self, msg: BackendMessage) -> PgResult<AuthStep> {
        match msg {
            BackendMessage::AuthenticationOk => Ok(AuthStep::Done),
            BackendMessage::AuthenticationCleartextPassword => {
                let password = self.password().await?;
                Ok(AuthStep::Respond(
                    PasswordMessage { password }.encode(&mut self.frame),
                ))
            }
            BackendMessage::AuthenticationMD5Password { salt } => {
                let password = self.password().await?;
                let hash = md5_password(&self.user, &password, &salt);
                Ok(AuthStep::Respond(
                    PasswordMessage { password: hash }.encode(&mut self.frame),
                ))
            }
            BackendMessage::AuthenticationSASL { mechanisms } => {
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(PgError::AuthNotImplemented(mechanisms.join(", ")));
                }
                let password = self.password().await?;
                let scram = ScramClient::new(&self.user, &password);
                let frame = SaslInitialResponseMessage {
                    mechanism: SCRAM_SHA_256.to_string(),
                    data: scram.client_first(),
                }
                .encode(&mut self.frame);
                self.scram = Some(scram);
                Ok(AuthStep::Respond(frame))
            }
            BackendMessage::AuthenticationSASLContinue { data } => {
                let scram = self.scram.as_mut().ok_or_else(|| {
                    PgError::Protocol("SASLContinue before SASL start".to_string())
                })?;
                let data = scram.client_final(&data)?;
                Ok(AuthStep::Respond(
                    SaslResponseMessage { data }.encode(&mut self.frame),
                ))
            }
            BackendMessage::AuthenticationSASLFinal { data } => {
                let scram = self.scram.as_mut().ok_or_else(|| {
                    PgError::Protocol("SASLFinal before SASL start".to_string())
                })?;
                scram.verify(&data)?;
                // AuthenticationOk follows.
                Ok(AuthStep::Respond(Bytes::new()))
            }
            BackendMessage::AuthenticationOther { kind } => {
                Err(PgError::AuthNotImplemented(auth_type_name(kind)))
            }
            other => Err(PgError::Protocol(format!(
                "Expected an authentication request, got {:?}",
                other
            ))),
        }
    }
}

/// Compute MD5 password hash: `md5(md5(password + user) + salt)`.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user).as_bytes());

    let mut outer_input = format!("{:x}", inner).into_bytes();
    outer_input.extend_from_slice(salt);

    format!("md5{:x}", md5::compute(&outer_input))
}
