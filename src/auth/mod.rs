pub mod token;
pub mod traits;

pub use token::{unix_seconds, Token, TokenAuthenticator, TokenError};
pub use traits::*;

use crate::config::AuthConfig;
use std::sync::Arc;

/// Create the authenticator for the configured shared secret
pub fn new(config: &AuthConfig) -> Result<Arc<dyn Authenticator>, TokenError> {
    let authenticator = TokenAuthenticator::new(&config.secret, config.window())?;
    Ok(Arc::new(authenticator))
}
