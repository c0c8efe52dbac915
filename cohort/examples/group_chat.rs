//! Two members chatting through a replicated chat room.
//!
//! Run with `RUST_LOG=info cargo run --example group_chat`.

use std::sync::Arc;
use std::time::Duration;

use cohort::connection::{MemoryNetwork, MemoryTransport};
use cohort::events::ContainerEvent;
use cohort::sharedobject::{FactoryRegistry, SharedObject, SharedObjectContext};
use cohort::{
    ConnectContext, Container, GroupServer, Id, IdValue, ReplicationFlags, SharedObjectError,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Chat room replica: keeps the transcript and prints new lines.
struct ChatRoom {
    transcript: Vec<String>,
}

impl SharedObject for ChatRoom {
    fn handle_message(
        &mut self,
        ctx: &mut SharedObjectContext<'_>,
        from: &Id,
        payload: &[u8],
    ) -> Result<(), SharedObjectError> {
        let line = String::from_utf8(payload.to_vec())
            .map_err(|e| SharedObjectError::Handler(e.to_string()))?;
        info!(at = %ctx.local_container_id(), from = %from, line = %line, "chat");
        self.transcript.push(line);
        Ok(())
    }

    fn replication_state(&self) -> Vec<u8> {
        self.transcript.join("\n").into_bytes()
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<(), SharedObjectError> {
        let text = String::from_utf8_lossy(state);
        self.transcript = text.lines().map(str::to_string).collect();
        Ok(())
    }
}

fn factories() -> FactoryRegistry {
    let registry = FactoryRegistry::new();
    registry.register_fn("chat-room", |_id, _home, _args| {
        Ok(Box::new(ChatRoom {
            transcript: Vec::new(),
        }))
    });
    registry
}

fn member(name: &str, network: &MemoryNetwork) -> Container {
    let container = Container::builder(Arc::new(MemoryTransport::memory(network.clone())))
        .local_id(Id::new("member", IdValue::String(name.to_string())))
        .factories(factories())
        .build();
    container
        .events()
        .containers()
        .subscribe_all(|event: &ContainerEvent| info!(?event, "container event"));
    container
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let network = MemoryNetwork::new();
    let group = Id::new("group", IdValue::String("lobby".to_string()));
    let server = GroupServer::builder(group.clone())
        .factories(factories())
        .build()?;
    server.listen(network.bind(&group.to_external_form())?);

    let alice = member("alice", &network);
    let bob = member("bob", &network);
    alice.connect(group.clone(), ConnectContext::new()).await?;

    let room = Id::new("room", IdValue::String("general".to_string()));
    alice.manager().create_shared_object(
        room.clone(),
        "chat-room",
        Vec::new(),
        ReplicationFlags::AUTO_REPLICATE,
    )?;
    alice
        .manager()
        .send_message(&room, None, b"anyone here?".to_vec())?;

    // Bob joins late and receives the room with its transcript.
    tokio::time::sleep(Duration::from_millis(50)).await;
    bob.connect(group.clone(), ConnectContext::new()).await?;
    bob.manager()
        .send_message(&room, None, b"hi alice".to_vec())?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    info!(members = ?server.members(), "group");
    bob.disconnect();
    alice.disconnect();
    server.shutdown();
    Ok(())
}
