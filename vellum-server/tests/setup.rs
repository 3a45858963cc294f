use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::Context as _;
use futures::{SinkExt as _, StreamExt as _};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vellum_server::config::CollabServiceConfig;
use vellum_server::storage::{
    DocumentRecord, SessionRecord, Storage, StorageService, WorkspaceRole,
};
use vellum_server::{CollabHooks, CollabServiceBuilder};
use vellum_types::{Principal, Visibility};
use yrs::sync::{Message, SyncMessage};
use yrs::updates::decoder::Decode as _;
use yrs::updates::encoder::Encode as _;
use yrs::{Doc, GetString as _, ReadTxn as _, Transact as _, Update};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub crdt_state: Option<Vec<u8>>,
    pub content: Option<Value>,
    pub properties: serde_json::Map<String, Value>,
    pub visibility: Visibility,
    pub created_by: Uuid,
    pub workspace_id: Uuid,
}

/// One recorded persistence write, for assertions.
#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub doc_id: Uuid,
    pub crdt_state: Vec<u8>,
    pub properties: serde_json::Map<String, Value>,
}

/// In-memory storage backend for the test suite.
#[derive(Default)]
pub struct MemoryStorage {
    pub documents: Mutex<HashMap<Uuid, StoredDocument>>,
    pub sessions: Mutex<HashMap<String, SessionRecord>>,
    pub roles: Mutex<HashMap<(Uuid, Uuid), WorkspaceRole>>,
    pub writes: Mutex<Vec<RecordedWrite>>,
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_document(&self, doc_id: Uuid) -> eyre::Result<Option<DocumentRecord>> {
        Ok(self.documents.lock().get(&doc_id).map(|doc| DocumentRecord {
            crdt_state: doc.crdt_state.clone(),
            content: doc.content.clone(),
            visibility: doc.visibility,
            created_by: doc.created_by,
            workspace_id: doc.workspace_id,
        }))
    }

    async fn save_document(
        &self,
        doc_id: Uuid,
        crdt_state: &[u8],
        properties: &serde_json::Map<String, Value>,
    ) -> eyre::Result<()> {
        let mut documents = self.documents.lock();
        let Some(doc) = documents.get_mut(&doc_id) else {
            eyre::bail!("document {doc_id} does not exist");
        };
        doc.crdt_state = Some(crdt_state.to_vec());
        for (key, value) in properties {
            if value.is_null() {
                doc.properties.remove(key);
            } else {
                doc.properties.insert(key.clone(), value.clone());
            }
        }
        self.writes.lock().push(RecordedWrite {
            doc_id,
            crdt_state: crdt_state.to_vec(),
            properties: properties.clone(),
        });
        Ok(())
    }

    async fn fetch_session(&self, token: &str) -> eyre::Result<Option<SessionRecord>> {
        Ok(self.sessions.lock().get(token).cloned())
    }

    async fn touch_session(&self, token: &str) -> eyre::Result<()> {
        if let Some(session) = self.sessions.lock().get_mut(token) {
            session.last_activity = Utc::now();
        }
        Ok(())
    }

    async fn delete_session(&self, token: &str) -> eyre::Result<()> {
        self.sessions.lock().remove(token);
        Ok(())
    }

    async fn workspace_role(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
    ) -> eyre::Result<Option<WorkspaceRole>> {
        Ok(self.roles.lock().get(&(workspace_id, user_id)).copied())
    }
}

pub struct TestBackend {
    pub addr: SocketAddr,
    pub storage: Arc<MemoryStorage>,
    pub hooks: CollabHooks,
    pub workspace_id: Uuid,
    pub cancellation_token: CancellationToken,
}

impl TestBackend {
    /// Starts a server on an ephemeral port with tightened timers so the
    /// suite runs fast.
    pub async fn start(tweak: impl FnOnce(&mut CollabServiceConfig)) -> eyre::Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("vellum_server=debug,info")
            .with_test_writer()
            .try_init();

        let mut config = CollabServiceConfig::default_for_tests();
        config.write_debounce = Duration::from_millis(200);
        config.room_teardown_grace = Duration::from_millis(300);
        config.protection_window = Duration::from_secs(5);
        tweak(&mut config);

        let storage = Arc::new(MemoryStorage::default());
        let storage_service: StorageService = storage.clone();
        let cancellation_token = CancellationToken::new();
        let (router, hooks) =
            CollabServiceBuilder::init(config, storage_service, cancellation_token.clone()).build();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("while binding test listener")?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });

        Ok(Self {
            addr,
            storage,
            hooks,
            workspace_id: Uuid::new_v4(),
            cancellation_token,
        })
    }

    /// Seeds a live session and returns the principal it authenticates.
    pub fn seed_session(&self, token: &str) -> Principal {
        let principal = Principal {
            user_id: Uuid::new_v4(),
            workspace_id: self.workspace_id,
        };
        self.seed_session_for(token, principal, Utc::now(), Utc::now());
        principal
    }

    pub fn seed_session_for(
        &self,
        token: &str,
        principal: Principal,
        created_at: DateTime<Utc>,
        last_activity: DateTime<Utc>,
    ) {
        self.storage.sessions.lock().insert(
            token.to_owned(),
            SessionRecord {
                user_id: principal.user_id,
                workspace_id: principal.workspace_id,
                created_at,
                last_activity,
            },
        );
    }

    /// Seeds a workspace-visible document owned by a fresh principal.
    pub fn seed_document(&self, doc_id: Uuid, content: Option<Value>, crdt_state: Option<Vec<u8>>) {
        self.seed_document_with(
            doc_id,
            content,
            crdt_state,
            Visibility::Workspace,
            Uuid::new_v4(),
        );
    }

    pub fn seed_document_with(
        &self,
        doc_id: Uuid,
        content: Option<Value>,
        crdt_state: Option<Vec<u8>>,
        visibility: Visibility,
        created_by: Uuid,
    ) {
        self.storage.documents.lock().insert(
            doc_id,
            StoredDocument {
                crdt_state,
                content,
                properties: serde_json::Map::new(),
                visibility,
                created_by,
                workspace_id: self.workspace_id,
            },
        );
    }

    pub async fn connect_raw(&self, path: &str, session: &str) -> eyre::Result<WsStream> {
        let url = format!("ws://{}{}", self.addr, path);
        let mut request = url
            .into_client_request()
            .context("while building ws request")?;
        request.headers_mut().insert(
            http::header::COOKIE,
            format!("session_id={session}").parse()?,
        );
        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .context("while connecting websocket")?;
        Ok(stream)
    }

    pub async fn connect_room(&self, room: &str, session: &str) -> eyre::Result<WsStream> {
        self.connect_raw(&format!("/collaboration/{room}"), session)
            .await
    }

    pub async fn connect_events(&self, session: &str) -> eyre::Result<WsStream> {
        self.connect_raw("/events", session).await
    }
}

/// Receives the next binary frame, skipping control frames.
pub async fn recv_binary(ws: &mut WsStream) -> eyre::Result<Vec<u8>> {
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let frame = ws
                .next()
                .await
                .ok_or_else(|| eyre::eyre!("socket closed while waiting for a binary frame"))??;
            match frame {
                TungsteniteMessage::Binary(data) => return Ok(data.to_vec()),
                TungsteniteMessage::Ping(_) | TungsteniteMessage::Pong(_) => continue,
                other => eyre::bail!("expected a binary frame, got {other:?}"),
            }
        }
    })
    .await
    .context("timed out waiting for a binary frame")?
}

/// Receives the next text frame, skipping control frames.
pub async fn recv_text(ws: &mut WsStream) -> eyre::Result<String> {
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let frame = ws
                .next()
                .await
                .ok_or_else(|| eyre::eyre!("socket closed while waiting for a text frame"))??;
            match frame {
                TungsteniteMessage::Text(text) => return Ok(text.to_string()),
                TungsteniteMessage::Ping(_) | TungsteniteMessage::Pong(_) => continue,
                other => eyre::bail!("expected a text frame, got {other:?}"),
            }
        }
    })
    .await
    .context("timed out waiting for a text frame")?
}

/// Waits for the server-initiated close frame and returns `(code, reason)`.
pub async fn recv_close(ws: &mut WsStream) -> eyre::Result<(u16, String)> {
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let frame = ws
                .next()
                .await
                .ok_or_else(|| eyre::eyre!("socket closed without a close frame"))??;
            match frame {
                TungsteniteMessage::Close(Some(frame)) => {
                    return Ok((u16::from(frame.code), frame.reason.to_string()));
                }
                TungsteniteMessage::Close(None) => eyre::bail!("close frame without a code"),
                _ => continue,
            }
        }
    })
    .await
    .context("timed out waiting for a close frame")?
}

pub async fn send_binary(ws: &mut WsStream, payload: Vec<u8>) -> eyre::Result<()> {
    ws.send(TungsteniteMessage::Binary(payload.into()))
        .await
        .context("while sending binary frame")
}

/// A connected editor: a client-side replica plus its websocket.
pub struct TestEditor {
    pub doc: Doc,
    pub ws: WsStream,
}

impl TestEditor {
    /// Connects to a room and performs the sync handshake: consume the
    /// server's step 1, announce our own state vector, and apply the step 2
    /// diff.
    pub async fn join(backend: &TestBackend, room: &str, session: &str) -> eyre::Result<Self> {
        let mut ws = backend.connect_room(room, session).await?;
        let first = recv_binary(&mut ws).await?;
        let Ok(Message::Sync(SyncMessage::SyncStep1(_server_state))) = Message::decode_v1(&first)
        else {
            eyre::bail!("expected the server's sync step 1 as the first frame");
        };

        let doc = Doc::new();
        doc.get_or_insert_xml_fragment("content");
        let state_vector = doc.transact().state_vector();
        send_binary(
            &mut ws,
            Message::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1(),
        )
        .await?;

        let mut editor = Self { doc, ws };
        // the step 2 reply may be preceded by a presence snapshot
        editor.recv_update().await?;
        Ok(editor)
    }

    /// Applies a received sync frame to the local replica. Returns `false`
    /// for non-sync frames (e.g. presence).
    pub fn apply_frame(&mut self, frame: &[u8]) -> eyre::Result<bool> {
        match Message::decode_v1(frame) {
            Ok(Message::Sync(SyncMessage::SyncStep2(update)))
            | Ok(Message::Sync(SyncMessage::Update(update))) => {
                let update = Update::decode_v1(&update)
                    .map_err(|err| eyre::eyre!("undecodable update: {err:?}"))?;
                let mut txn = self.doc.transact_mut();
                txn.apply_update(update);
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(err) => Err(eyre::eyre!("undecodable frame: {err:?}")),
        }
    }

    /// Receives frames until one of them was a document update.
    pub async fn recv_update(&mut self) -> eyre::Result<()> {
        loop {
            let frame = recv_binary(&mut self.ws).await?;
            if self.apply_frame(&frame)? {
                return Ok(());
            }
        }
    }

    /// Runs a local mutation and sends the resulting delta to the server.
    pub async fn push_edit<F>(&mut self, mutate: F) -> eyre::Result<()>
    where
        F: FnOnce(&mut yrs::TransactionMut<'_>),
    {
        let before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            mutate(&mut txn);
        }
        let update = self.doc.transact().encode_state_as_update_v1(&before);
        send_binary(
            &mut self.ws,
            Message::Sync(SyncMessage::Update(update)).encode_v1(),
        )
        .await
    }

    /// The XML rendering of the replica's tree, for structural assertions.
    pub fn tree_string(&self) -> String {
        let fragment = self.doc.get_or_insert_xml_fragment("content");
        let txn = self.doc.transact();
        fragment.get_string(&txn)
    }
}
