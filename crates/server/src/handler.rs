//! Handler trait for processing WebSocket messages.
//!
//! Implementors provide the upload semantics while the server framework
//! handles connections, routing and the binary chunk frames.

use std::future::Future;
use std::pin::Pin;

use chunkdrop_protocol::constants::{ERR_NOT_IMPLEMENTED, MessageType};
use chunkdrop_protocol::envelope::Message;
use chunkdrop_protocol::frame::ChunkHeader;

use crate::connection::Sender;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling messages from an upload client.
///
/// Each method receives a `sender` for replies and the parsed message.
/// Default implementations reply "not implemented" so handlers only need
/// to override the message types they support.
pub trait Handler: Send + Sync + 'static {
    /// Called for `ping` messages.
    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Ok(reply) = msg.reply(MessageType::Pong, Option::<&()>::None) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    /// Called for `init_session`.
    fn on_init_session(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `get_status`.
    fn on_get_status(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `complete`.
    fn on_complete(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `cancel`.
    fn on_cancel(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for a binary chunk frame.
    fn on_chunk(&self, sender: Sender, header: ChunkHeader, data: Vec<u8>) -> HandlerFuture<'_> {
        let _ = data;
        Box::pin(async move {
            let _ = sender.send_msg(Message::error(
                header.id,
                ERR_NOT_IMPLEMENTED,
                "chunk upload not implemented",
            ));
        })
    }

    /// Called when a client disconnects.
    fn on_disconnected(&self) -> HandlerFuture<'_> {
        Box::pin(async {})
    }
}

fn not_implemented<'a>(sender: Sender, msg: Message) -> HandlerFuture<'a> {
    Box::pin(async move {
        let _ = sender.send_error(&msg, ERR_NOT_IMPLEMENTED, "not implemented");
    })
}
