//! Remote destination provider.
//!
//! Drives one push session against a remote destination:
//!
//! ```text
//! disconnected -> connecting -> initialized -> bootstrapped -> closed
//!                                                          \-> rolled back
//! ```
//!
//! `bootstrap` opens the connection and runs `init` + `bootstrap`. Writers are
//! handed out afterwards, one per step. `close` sends `close` + `end` and
//! waits for the connection to shut down.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::config::ProviderOptions;
use crate::error::{ProviderError, Result};
use crate::streaming::assets::AssetWriter;
use crate::streaming::dispatcher::{Dispatcher, TransferProperties};
use crate::streaming::protocol::{
    Command, EndParams, InitOptions, InitParams, InitResponse, Step, TransferAction, TransferKind,
};
use crate::streaming::writer::{SessionSteps, StepWriter};
use crate::transport::{Connector, WebSocketConnector};

mod address;

pub use address::transfer_address;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Disconnected,
    Connecting,
    Initialized,
    Bootstrapped,
    Closed,
    RolledBack,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Disconnected => "disconnected",
            LifecycleState::Connecting => "connecting",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Bootstrapped => "bootstrapped",
            LifecycleState::Closed => "closed",
            LifecycleState::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

/// Push-direction destination reached over the transfer protocol
pub struct RemoteDestination {
    options: ProviderOptions,
    connector: Arc<dyn Connector>,
    dispatcher: Option<Arc<Dispatcher>>,
    steps: SessionSteps,
    state: LifecycleState,
}

impl RemoteDestination {
    pub fn new(options: ProviderOptions) -> Self {
        Self::with_connector(options, Arc::new(WebSocketConnector))
    }

    pub fn with_connector(options: ProviderOptions, connector: Arc<dyn Connector>) -> Self {
        Self {
            options,
            connector,
            dispatcher: None,
            steps: SessionSteps::default(),
            state: LifecycleState::Disconnected,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Session id minted by the destination on `init`
    pub fn transfer_id(&self) -> Option<&str> {
        self.dispatcher
            .as_ref()
            .and_then(|d| d.transfer_properties())
            .map(|p| p.id.as_str())
    }

    /// Connect, open the session and run the remote `bootstrap` action.
    ///
    /// The address is validated before any connection attempt.
    pub async fn bootstrap(&mut self) -> Result<()> {
        if self.state != LifecycleState::Disconnected {
            return Err(ProviderError::InvalidSequence(
                "bootstrap can only run on a disconnected destination",
            ));
        }

        let address = transfer_address(&self.options.url)?;

        self.state = LifecycleState::Connecting;
        tracing::info!(%address, "Connecting to remote destination");

        let connection = match self
            .connector
            .connect(&address, self.options.auth.as_ref())
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                self.state = LifecycleState::Disconnected;
                return Err(ProviderError::validation(
                    "connection",
                    format!("Failed to connect to {}: {}", address, e),
                ));
            }
        };

        let dispatcher = Dispatcher::spawn(connection);
        self.dispatcher = Some(dispatcher.clone());

        let transfer_id = self.init_transfer(&dispatcher).await?;
        dispatcher.set_transfer_properties(TransferProperties {
            id: transfer_id.clone(),
            kind: TransferKind::Push,
        })?;
        self.state = LifecycleState::Initialized;
        tracing::info!(%transfer_id, "Transfer session initialized");

        // Past init the session exists, so a lost connection fails the transfer
        dispatcher
            .dispatch_transfer_action(TransferAction::Bootstrap)
            .await
            .map_err(|e| match e {
                ProviderError::Connection(c) => {
                    ProviderError::Transfer(format!("Bootstrap failed: {}", c))
                }
                other => other,
            })?;
        self.state = LifecycleState::Bootstrapped;
        tracing::info!(%transfer_id, "Remote destination bootstrapped");
        Ok(())
    }

    async fn init_transfer(&self, dispatcher: &Dispatcher) -> Result<String> {
        let init = Command::Init(InitParams {
            options: InitOptions {
                strategy: self.options.strategy,
                restore: self.options.restore.clone(),
            },
            transfer: TransferKind::Push,
        });
        let response = dispatcher.dispatch_command(&init).await?;

        let response: InitResponse = serde_json::from_value(response).unwrap_or_default();
        match response.transfer_id {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(ProviderError::Protocol(
                "Init failed, invalid response from the server".to_string(),
            )),
        }
    }

    /// End the session and close the connection. Without an established
    /// session nothing is sent.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == LifecycleState::Closed {
            return Ok(());
        }
        let Some(dispatcher) = self.dispatcher.clone() else {
            return Ok(());
        };

        let Some(transfer_id) = dispatcher.transfer_properties().map(|p| p.id.clone()) else {
            tracing::debug!("No transfer session to end, dropping connection");
            dispatcher.abort().await;
            self.state = LifecycleState::Closed;
            return Ok(());
        };

        let ended = self.end_session(&dispatcher, transfer_id).await;
        let shutdown = dispatcher.shutdown().await;
        self.state = LifecycleState::Closed;
        tracing::info!("Remote destination closed");
        ended.and(shutdown)
    }

    async fn end_session(&self, dispatcher: &Dispatcher, transfer_id: String) -> Result<()> {
        dispatcher
            .dispatch_transfer_action(TransferAction::Close)
            .await?;
        dispatcher
            .dispatch_command(&Command::End(EndParams { transfer_id }))
            .await?;

        let pending = dispatcher.pending_requests();
        if pending > 0 {
            tracing::error!(pending, "Requests still pending at session end");
            return Err(ProviderError::Protocol(format!(
                "{} requests still pending at session end",
                pending
            )));
        }
        Ok(())
    }

    /// Ask the destination to undo the transfer. The connection stays open.
    pub async fn rollback(&mut self) -> Result<()> {
        let Some(dispatcher) = self.session().ok() else {
            return Ok(());
        };
        tracing::warn!(transfer_id = ?self.transfer_id(), "Rolling back transfer");
        dispatcher
            .dispatch_transfer_action(TransferAction::Rollback)
            .await?;
        self.state = LifecycleState::RolledBack;
        Ok(())
    }

    /// `None` before `bootstrap`
    pub async fn get_metadata(&self) -> Result<Option<Value>> {
        match &self.dispatcher {
            Some(d) => d
                .dispatch_transfer_action(TransferAction::GetMetadata)
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    /// `None` before `bootstrap`
    pub async fn get_schemas(&self) -> Result<Option<Value>> {
        match &self.dispatcher {
            Some(d) => d
                .dispatch_transfer_action(TransferAction::GetSchemas)
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    pub async fn before_transfer(&self) -> Result<()> {
        if let Some(d) = &self.dispatcher {
            d.dispatch_transfer_action(TransferAction::BeforeTransfer)
                .await?;
        }
        Ok(())
    }

    pub fn create_entities_writer(&self) -> Result<StepWriter> {
        self.record_writer(Step::Entities)
    }

    pub fn create_links_writer(&self) -> Result<StepWriter> {
        self.record_writer(Step::Links)
    }

    pub fn create_configuration_writer(&self) -> Result<StepWriter> {
        self.record_writer(Step::Configuration)
    }

    pub fn create_assets_writer(&self) -> Result<AssetWriter> {
        Ok(AssetWriter::new(
            self.session()?,
            self.steps.guard(Step::Assets),
            self.options.batch_size,
        ))
    }

    fn record_writer(&self, step: Step) -> Result<StepWriter> {
        Ok(StepWriter::new(
            self.session()?,
            self.steps.guard(step),
            self.options.batch_size,
        ))
    }

    fn session(&self) -> Result<Arc<Dispatcher>> {
        match &self.dispatcher {
            Some(d) if d.transfer_properties().is_some() => Ok(d.clone()),
            _ => Err(ProviderError::InvalidSequence(
                "writers are only available after bootstrap",
            )),
        }
    }
}
