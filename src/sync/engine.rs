//! The engine ties one watched tree to any number of connected parties.
//!
//! Local changes are broadcast to every party. Commands from a party are
//! applied to the local tree and passed on to every other party, so changes
//! travel through a hub to all of its leaves.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::fs::container::lock;
use crate::fs::{ContainerEvent, FileContainer, PathFilter, SyncData};
use crate::net::message::{Command, Message, PathBody};
use crate::net::messenger::{Messenger, MessengerEvent, MessengerEvents};
use crate::net::request::PendingRequests;
use crate::sync::driver::{self, SyncReport, SyncSubject};
use crate::sync::party::{Party, PartyId};
use crate::sync::strategy::{DeleteFlags, SyncStrategy};
use crate::transfer::{BandwidthLimit, BandwidthLimiter, TransferHelper, TransferQueue, TransferSettings};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub on_first_connection: SyncStrategy,
    pub on_reconnection: SyncStrategy,
    pub delete: DeleteFlags,
    pub transfer_concurrency: usize,
    pub bandwidth: BandwidthLimit,
    pub transfer: TransferSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            on_first_connection: SyncStrategy::NoOp,
            on_reconnection: SyncStrategy::NoOp,
            delete: DeleteFlags::default(),
            transfer_concurrency: 4,
            bandwidth: BandwidthLimit::unlimited(),
            transfer: TransferSettings::default(),
        }
    }
}

struct EngineInner {
    container: Arc<FileContainer>,
    config: EngineConfig,
    parties: Mutex<HashMap<PartyId, Arc<Party>>>,
    pending: PendingRequests,
    queue: Arc<TransferQueue>,
    limiter: BandwidthLimiter,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(container: Arc<FileContainer>, config: EngineConfig) -> Self {
        let queue = Arc::new(TransferQueue::new(config.transfer_concurrency));
        let limiter = BandwidthLimiter::new(config.bandwidth);
        Self {
            inner: Arc::new(EngineInner {
                container,
                config,
                parties: Mutex::new(HashMap::new()),
                pending: PendingRequests::new(),
                queue,
                limiter,
                next_id: AtomicU64::new(1),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn container(&self) -> &Arc<FileContainer> {
        &self.inner.container
    }

    /// Start watching the tree and broadcasting its changes.
    pub async fn start(&self) -> Result<()> {
        let mut events = self.inner.container.begin_watching().await?;
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = engine.inner.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                debug!(?event, "local change");
                engine.broadcast(local_command(event), None);
            }
        });
        Ok(())
    }

    /// Take over a connected messenger. Runs the first-connection strategy
    /// in the background.
    pub fn add_other_party_messenger(
        &self,
        messenger: Messenger,
        events: MessengerEvents,
        prefer_connecting: bool,
    ) -> PartyId {
        let inner = &self.inner;
        let id = PartyId(inner.next_id.fetch_add(1, Ordering::SeqCst));
        let transfers = TransferHelper::new(
            inner.container.clone(),
            messenger.clone(),
            inner.pending.clone(),
            inner.queue.clone(),
            inner.limiter.clone(),
            prefer_connecting,
            inner.config.transfer.clone(),
        );
        let party = Arc::new(Party::new(
            id,
            messenger,
            transfers,
            inner.pending.clone(),
            inner.config.transfer.request_timeout,
        ));
        lock(&inner.parties).insert(id, party.clone());
        info!(party = %id, "party connected");

        let engine = self.clone();
        tokio::spawn(async move { engine.party_loop(party, events).await });
        self.spawn_strategy(id, inner.config.on_first_connection);
        id
    }

    /// Reconcile with one party and wait for the outcome.
    pub async fn run_strategy(&self, party: PartyId, strategy: SyncStrategy) -> Result<SyncReport> {
        let party = self.party(party).ok_or(SyncError::Disconnected)?;
        driver::run(
            strategy,
            &self.inner.container,
            party.as_ref() as &dyn SyncSubject,
            self.inner.config.delete,
        )
        .await
    }

    pub fn parties(&self) -> Vec<PartyId> {
        let mut ids: Vec<_> = lock(&self.inner.parties).keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn messenger(&self, party: PartyId) -> Option<Messenger> {
        self.party(party).map(|party| party.messenger.clone())
    }

    /// Disconnect every party and stop watching.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        let parties: Vec<_> = lock(&self.inner.parties).drain().map(|(_, p)| p).collect();
        for party in parties {
            party.messenger.disconnect();
        }
        self.inner.container.stop_watching();
        info!("engine shut down");
    }

    fn party(&self, id: PartyId) -> Option<Arc<Party>> {
        lock(&self.inner.parties).get(&id).cloned()
    }

    fn spawn_strategy(&self, id: PartyId, strategy: SyncStrategy) {
        if strategy == SyncStrategy::NoOp {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.run_strategy(id, strategy).await {
                Ok(report) => info!(
                    party = %id,
                    %strategy,
                    transferred = report.transferred(),
                    conflicts = report.conflicts.len(),
                    "strategy finished"
                ),
                Err(e) => warn!(party = %id, %strategy, error = %e, "strategy failed"),
            }
        });
    }

    async fn party_loop(self, party: Arc<Party>, mut events: MessengerEvents) {
        loop {
            let event = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                MessengerEvent::Message(message) => self.handle_message(&party, message).await,
                MessengerEvent::Recovering => info!(party = %party.id, "connection lost, recovering"),
                MessengerEvent::Reconnected => {
                    info!(party = %party.id, "reconnected");
                    self.spawn_strategy(party.id, self.inner.config.on_reconnection);
                }
                MessengerEvent::Died => break,
            }
        }
        if lock(&self.inner.parties).remove(&party.id).is_some() {
            info!(party = %party.id, "party gone");
        }
    }

    async fn handle_message(&self, party: &Arc<Party>, message: Message) {
        let Message { command, id } = message;
        match command {
            Command::Response(value) => self.resolve(id, Ok(value)),
            Command::Error(body) => {
                if id.is_some() {
                    self.resolve(id, Err(SyncError::Remote(body.message)));
                } else {
                    warn!(party = %party.id, message = %body.message, "party reported an error");
                }
            }
            Command::CreateDirectory(PathBody { name }) => {
                let result = self.inner.container.create_directory(&name).await;
                self.finish_mutation(party, id, result, Command::CreateDirectory(PathBody { name }));
            }
            Command::DeletePath(PathBody { name }) => {
                let result = self.inner.container.delete_file(&name).await;
                self.finish_mutation(party, id, result, Command::DeletePath(PathBody { name }));
            }
            Command::GetMetaForFile(PathBody { name }) => {
                let engine = self.clone();
                let party = party.clone();
                tokio::spawn(async move {
                    let result = engine
                        .inner
                        .container
                        .get_file_meta(&name)
                        .await
                        .and_then(|meta| Ok(serde_json::to_value(meta)?));
                    reply(&party, id, result);
                });
            }
            Command::GetFileList => {
                let engine = self.clone();
                let party = party.clone();
                tokio::spawn(async move {
                    let result = engine
                        .inner
                        .container
                        .get_file_tree()
                        .await
                        .and_then(|names| Ok(serde_json::to_value(names)?));
                    reply(&party, id, result);
                });
            }
            Command::Transfer(request) => {
                let engine = self.clone();
                let party = party.clone();
                tokio::spawn(async move {
                    let name = request.name.clone();
                    match party.transfers.serve(id, request).await {
                        Ok(Some(received)) => engine.broadcast(
                            Command::DownloadChanged(PathBody::new(received)),
                            Some(party.id),
                        ),
                        Ok(None) => {}
                        Err(e) => warn!(party = %party.id, name, error = %e, "transfer failed"),
                    }
                });
            }
            Command::DownloadChanged(PathBody { name }) => {
                self.spawn_fetch(party, name, Command::DownloadChanged)
            }
            Command::DownloadNew(PathBody { name }) => self.spawn_fetch(party, name, Command::DownloadNew),
        }
    }

    /// Fetch a file the party announced, then pass the announcement on.
    fn spawn_fetch(&self, party: &Arc<Party>, name: String, announce: fn(PathBody) -> Command) {
        if self.inner.container.filter().is_ignored(&name, false) {
            debug!(party = %party.id, name, "ignoring announcement of excluded file");
            return;
        }
        let engine = self.clone();
        let party = party.clone();
        tokio::spawn(async move {
            match engine.fetch_if_different(&party, &name).await {
                Ok(true) => engine.broadcast(announce(PathBody::new(name)), Some(party.id)),
                Ok(false) => {}
                Err(e) => warn!(party = %party.id, name, error = %e, "failed to fetch announced file"),
            }
        });
    }

    /// Bring `name` in line with the party's copy. Returns whether anything
    /// changed locally.
    async fn fetch_if_different(&self, party: &Party, name: &str) -> Result<bool> {
        let container = &self.inner.container;
        let (remote, local) = futures::try_join!(
            party.get_remote_file_meta(name),
            container.get_file_meta(name)
        )?;

        match plan_fetch(container.filter(), name, &local, &remote) {
            Fetch::Nothing => Ok(false),
            Fetch::CreateDirectory => {
                container.create_directory(name).await?;
                Ok(true)
            }
            Fetch::Download => {
                party.transfers.request_file(name).await?;
                Ok(true)
            }
        }
    }

    fn finish_mutation(&self, party: &Party, id: Option<String>, result: Result<()>, announce: Command) {
        match result {
            Ok(()) => {
                reply(party, id, Ok(Value::Bool(true)));
                self.broadcast(announce, Some(party.id));
            }
            Err(e) => {
                warn!(party = %party.id, kind = announce.kind(), error = %e, "failed to apply change");
                reply(party, id, Err(e));
            }
        }
    }

    fn resolve(&self, id: Option<String>, result: Result<Value>) {
        let Some(id) = id else {
            warn!("reply without an id");
            return;
        };
        if let Err(e) = self.inner.pending.resolve(&id, result) {
            debug!(error = %e, "late or unexpected reply");
        }
    }

    /// Send `command` to every live party except `origin`.
    fn broadcast(&self, command: Command, origin: Option<PartyId>) {
        let targets: Vec<_> = lock(&self.inner.parties)
            .values()
            .filter(|party| Some(party.id) != origin)
            .cloned()
            .collect();
        for party in targets {
            if !party.messenger.is_alive() {
                debug!(party = %party.id, kind = command.kind(), "skipping party that is not connected");
                continue;
            }
            party.messenger.write_message(Message::new(command.clone()));
        }
    }
}

fn reply(party: &Party, id: Option<String>, result: Result<Value>) {
    let command = match result {
        Ok(value) => Command::Response(value),
        Err(e) => {
            warn!(party = %party.id, error = %e, "request failed");
            Command::error(e.to_string())
        }
    };
    if let Some(id) = id {
        party.messenger.write_message(Message::with_id(command, id));
    }
}

fn local_command(event: ContainerEvent) -> Command {
    match event {
        ContainerEvent::Changed(name) => Command::DownloadChanged(PathBody { name }),
        ContainerEvent::FileCreated(name) => Command::DownloadNew(PathBody { name }),
        ContainerEvent::CreatedDirectory(name) => Command::CreateDirectory(PathBody { name }),
        ContainerEvent::Deleted(name) => Command::DeletePath(PathBody { name }),
    }
}

/// What an announced name needs locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fetch {
    Nothing,
    CreateDirectory,
    Download,
}

fn plan_fetch(filter: &PathFilter, name: &str, local: &SyncData, remote: &SyncData) -> Fetch {
    if !remote.exists {
        return Fetch::Nothing;
    }
    if filter.is_ignored(name, remote.is_directory) {
        debug!(name, "ignoring announcement of excluded path");
        return Fetch::Nothing;
    }
    if remote.is_directory {
        if local.exists && local.is_directory {
            return Fetch::Nothing;
        }
        return Fetch::CreateDirectory;
    }
    if local.same_content(remote) {
        debug!(name, "already up to date");
        return Fetch::Nothing;
    }
    Fetch::Download
}
