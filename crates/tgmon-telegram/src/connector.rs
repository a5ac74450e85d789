use std::time::Duration;

use async_trait::async_trait;

use tgmon_core::{
    errors::Error,
    messaging::port::{SessionConnector, SessionHandle},
    registry::Account,
    Result,
};

use crate::TelegramSession;

/// Opens a [`TelegramSession`] from an account's bot token.
#[derive(Clone, Debug)]
pub struct BotConnector {
    poll_timeout: Duration,
}

impl BotConnector {
    pub fn new(poll_timeout: Duration) -> Self {
        Self { poll_timeout }
    }
}

#[async_trait]
impl SessionConnector for BotConnector {
    async fn open(&self, account: &Account) -> Result<Box<dyn SessionHandle>> {
        let token = account.credential.reveal().ok_or_else(|| {
            Error::AuthExpired(format!(
                "no bot token available for account '{}' ({:?})",
                account.name, account.credential
            ))
        })?;
        let session = TelegramSession::new(account.name.clone(), &token, self.poll_timeout)?;
        Ok(Box::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tgmon_core::{domain::AccountName, registry::Credential};

    #[tokio::test]
    async fn missing_token_means_re_login() {
        let connector = BotConnector::new(Duration::from_secs(30));
        let account = Account {
            name: AccountName::new("main"),
            credential: Credential::Env("TGMON_TEST_TOKEN_THAT_IS_NEVER_SET".into()),
            enabled: true,
        };
        match connector.open(&account).await {
            Err(Error::AuthExpired(msg)) => assert!(msg.contains("main")),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn token_yields_session_for_account() {
        let connector = BotConnector::new(Duration::from_secs(30));
        let account = Account {
            name: AccountName::new("main"),
            credential: Credential::Token("123456:TEST".into()),
            enabled: true,
        };
        let session = connector.open(&account).await.unwrap();
        assert_eq!(session.account().as_str(), "main");
    }
}
