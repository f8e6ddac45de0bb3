//! Store-wide shutdown flag.

use crate::backend::Backend;
use crate::config::{keys, parse_flag};
use crate::error::Result;

/// Sets and reads the shared `shutdown` flag.
///
/// Workers check the flag before every claim. Setting it never interrupts a
/// running job; it only stops new claims.
pub struct ShutdownCoordinator<'a, B: Backend + ?Sized> {
    backend: &'a B,
}

impl<'a, B: Backend + ?Sized> ShutdownCoordinator<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    /// Ask every worker to stop claiming.
    pub async fn signal_shutdown(&self) -> Result<()> {
        self.backend.set_config(keys::SHUTDOWN, "true").await?;
        tracing::info!("Shutdown signalled");
        Ok(())
    }

    /// Allow workers started from now on to claim again.
    pub async fn signal_resume(&self) -> Result<()> {
        self.backend.set_config(keys::SHUTDOWN, "false").await?;
        tracing::debug!("Shutdown flag cleared");
        Ok(())
    }

    /// Read the flag. Anything other than a true value counts as false.
    pub async fn is_shutdown_requested(&self) -> Result<bool> {
        let raw = self.backend.get_config(keys::SHUTDOWN, "false").await?;
        Ok(parse_flag(&raw).unwrap_or(false))
    }
}
