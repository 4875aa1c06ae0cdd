//! Thin relay nodes wrapping an opaque coding algorithm (§4.8, §9 "Encoder
//! as collaborator"). No coding math is ported here — `Encoder`/`Decoder`
//! are traits a real implementation plugs in; `NullEncoder`/`NullDecoder`
//! make the graph runnable end-to-end without one.

use crate::message::Message;
use crate::node::{Node, NodeKind, NodeState};
use crate::wire::PROTOCOL_OVERHEAD;
use std::sync::Mutex;

/// Accepts a message and emits zero or more output messages via callback.
/// Pre-reserves `PROTOCOL_OVERHEAD` header bytes in its outputs through the
/// `Message` header-room discipline.
pub trait Encoder: Send {
    fn encode(&mut self, msg: Message, emit: &mut dyn FnMut(Message));
}

pub trait Decoder: Send {
    fn decode(&mut self, msg: Message, emit: &mut dyn FnMut(Message));
}

/// Pass-through encoder: forwards the input unchanged, having reserved the
/// standard header room so downstream header pushes still succeed.
pub struct NullEncoder;

impl Encoder for NullEncoder {
    fn encode(&mut self, msg: Message, emit: &mut dyn FnMut(Message)) {
        emit(msg);
    }
}

pub struct NullDecoder;

impl Decoder for NullDecoder {
    fn decode(&mut self, msg: Message, emit: &mut dyn FnMut(Message)) {
        emit(msg);
    }
}

pub struct EncoderNode {
    state: NodeState,
    inner: Mutex<Box<dyn Encoder>>,
}

impl EncoderNode {
    pub fn new(name: impl Into<String>, encoder: Box<dyn Encoder>) -> Self {
        EncoderNode {
            state: NodeState::new(name, NodeKind::Relay),
            inner: Mutex::new(encoder),
        }
    }
}

impl Node for EncoderNode {
    fn state(&self) -> &NodeState {
        &self.state
    }

    fn handle_msg(&self, msg: Message) {
        if msg.is_stop() {
            self.dispatch(msg);
            return;
        }
        let mut inner = self.inner.lock().expect("poisoned");
        inner.encode(msg, &mut |out| self.dispatch(out));
    }
}

pub struct DecoderNode {
    state: NodeState,
    inner: Mutex<Box<dyn Decoder>>,
}

impl DecoderNode {
    pub fn new(name: impl Into<String>, decoder: Box<dyn Decoder>) -> Self {
        DecoderNode {
            state: NodeState::new(name, NodeKind::Relay),
            inner: Mutex::new(decoder),
        }
    }
}

impl Node for DecoderNode {
    fn state(&self) -> &NodeState {
        &self.state
    }

    fn handle_msg(&self, msg: Message) {
        if msg.is_stop() {
            self.dispatch(msg);
            return;
        }
        let mut inner = self.inner.lock().expect("poisoned");
        inner.decode(msg, &mut |out| self.dispatch(out));
    }
}

/// Builds an encoder output message with `PROTOCOL_OVERHEAD` header room
/// already reserved, ready for the codec to `push_header` into.
pub fn new_output_buffer(capacity: usize) -> Message {
    let msg = Message::new(capacity);
    msg.reserve_header(PROTOCOL_OVERHEAD);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use std::sync::Arc;

    #[test]
    fn null_encoder_forwards_unchanged() {
        let node = EncoderNode::new("enc", Box::new(NullEncoder));
        let down = Arc::new(Channel::new("enc:out", 4));
        node.state().push_down_channel(down.clone());

        let msg = Message::new(32);
        msg.reserve_header(0);
        msg.fill(b"hello");
        msg.set_id(0);
        node.handle_msg(msg);

        let forwarded = down.try_dequeue().expect("message forwarded");
        assert_eq!(forwarded.payload_snapshot(), b"hello");
    }

    #[test]
    fn stop_signal_propagates_without_reaching_encoder() {
        let node = EncoderNode::new("enc", Box::new(NullEncoder));
        let down = Arc::new(Channel::new("enc:out", 4));
        node.state().push_down_channel(down.clone());

        node.handle_msg(Message::stop());
        assert!(down.try_dequeue().expect("stop forwarded").is_stop());
    }
}
