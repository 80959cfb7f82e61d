//! Stackable byte-stream protocol layers.
//!
//! A [`ProtocolStack`] owns its layers bottom-to-top in a flat container.
//! Layers never call each other directly; they emit their output through a
//! [`LayerIo`] and the stack routes it with a FIFO task queue. Bytes a layer
//! sends downward (acks, retransmits) are processed before the frames it
//! delivers upward, so control traffic hits the wire ahead of any response
//! the application produces for those frames.
//!
//! `decode` runs bottom→top and returns the frames that popped out of the
//! top; the application pushes responses back in through [`Responder`]
//! (which a stack implements at its top). Completed bottom-level frames
//! accumulate until collected with [`ProtocolStack::take_tx`].

pub mod arq;
pub mod ascii;
pub mod buffer;
pub mod crc;
pub mod debug_arq;
pub mod loopback;
pub mod segmentation;
pub mod terminal;

use std::any::Any;
use std::collections::VecDeque;

/// Uniform downcast access, so applications can reach a specific layer
/// inside a built stack (see [`ProtocolStack::with_layer`]).
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: 'static> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Output collector handed to every layer call.
pub struct LayerIo {
    up: Vec<Vec<u8>>,
    down: Vec<(Vec<u8>, bool)>,
    below_mtu: usize,
}

impl LayerIo {
    fn new(below_mtu: usize) -> Self {
        LayerIo {
            up: Vec::new(),
            down: Vec::new(),
            below_mtu,
        }
    }

    /// Deliver a decoded frame to the layer above.
    pub fn up(&mut self, frame: Vec<u8>) {
        self.up.push(frame);
    }

    /// Emit bytes toward the transport. `last` closes the current frame.
    pub fn down(&mut self, bytes: &[u8], last: bool) {
        self.down.push((bytes.to_vec(), last));
    }

    pub fn down_owned(&mut self, bytes: Vec<u8>, last: bool) {
        self.down.push((bytes, last));
    }

    /// MTU of everything below this layer; 0 means unbounded.
    pub fn below_mtu(&self) -> usize {
        self.below_mtu
    }
}

/// A byte-stream transform with decode (bottom→top) and encode
/// (top→bottom) halves.
pub trait Layer: AsAny {
    fn decode(&mut self, buf: &mut Vec<u8>, io: &mut LayerIo);

    /// Push payload downward. A layer may buffer partial encodes until
    /// `last` is set.
    fn encode(&mut self, buf: &[u8], last: bool, io: &mut LayerIo);

    /// Maximum payload this layer passes unsplit, given the MTU below it;
    /// 0 means unbounded.
    fn mtu(&self, below: usize) -> usize {
        below
    }

    /// Force out buffered state. Returns `false` when something remains
    /// buffered.
    fn flush(&mut self, _io: &mut LayerIo) -> bool {
        true
    }

    /// Drop internal state.
    fn reset(&mut self) {}

    /// Response purgeability marker travelling down from the application.
    /// Return `true` to consume it.
    fn set_purgeable(&mut self, _purgeable: bool, _io: &mut LayerIo) -> bool {
        false
    }
}

/// Where the application pushes its response frames.
pub trait Responder {
    fn write(&mut self, data: &[u8], last: bool);

    /// Mark the response under construction as re-computable, so a
    /// reliability layer need not buffer it for retransmission.
    fn set_purgeable(&mut self, _purgeable: bool) {}
}

enum Task {
    Decode { layer: usize, data: Vec<u8> },
    Encode { layer: Option<usize>, data: Vec<u8>, last: bool },
    Flush { layer: usize },
}

/// An explicitly constructed chain of layers plus the transmit-side frame
/// buffer.
#[derive(Default)]
pub struct ProtocolStack {
    // Bottom (transport side) first.
    layers: Vec<Box<dyn Layer>>,
    transport_mtu: usize,
    tx_partial: Vec<u8>,
    tx: Vec<Vec<u8>>,
}

impl ProtocolStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the bottom-level frame size, as imposed by the transport.
    pub fn set_transport_mtu(&mut self, mtu: usize) {
        self.transport_mtu = mtu;
    }

    /// Add a layer on top of the current chain (build bottom-up).
    pub fn push<L: Layer + 'static>(&mut self, layer: L) -> &mut Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    fn mtu_below(&self, i: usize) -> usize {
        let mut m = self.transport_mtu;
        for l in &self.layers[..i] {
            m = l.mtu(m);
        }
        m
    }

    /// Effective MTU at the top of the stack.
    pub fn mtu(&self) -> usize {
        self.mtu_below(self.layers.len())
    }

    /// Feed transport bytes into the bottom; returns the frames that popped
    /// out of the top.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.run(Task::Decode {
            layer: 0,
            data: bytes.to_vec(),
        })
    }

    /// Push one complete application frame down the stack.
    pub fn encode(&mut self, frame: &[u8]) {
        self.encode_partial(frame, true);
    }

    /// Push part of an application frame; `last` closes it.
    pub fn encode_partial(&mut self, frame: &[u8], last: bool) {
        let top = self.layers.len().checked_sub(1);
        self.run(Task::Encode {
            layer: top,
            data: frame.to_vec(),
            last,
        });
    }

    /// Force buffered state out of every layer, top to bottom.
    pub fn flush(&mut self) {
        if let Some(top) = self.layers.len().checked_sub(1) {
            self.run(Task::Flush { layer: top });
        }
    }

    /// Drop every layer's internal state and any unsent partial frame.
    pub fn reset(&mut self) {
        for l in self.layers.iter_mut().rev() {
            l.reset();
        }
        self.tx_partial.clear();
    }

    /// Collect completed bottom-level frames for the transport.
    pub fn take_tx(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.tx)
    }

    /// Run `f` against the layer at `index` (0 = bottom), routing whatever
    /// it emits through the rest of the stack. This is how applications
    /// drive layer-specific operations such as [`arq::ArqLayer::keep_alive`].
    pub fn with_layer<L, R>(&mut self, index: usize, f: impl FnOnce(&mut L, &mut LayerIo) -> R) -> Option<R>
    where
        L: Layer + 'static,
    {
        let mut io = LayerIo::new(self.mtu_below(index));
        // Deref past the Box, whose own blanket AsAny impl would shadow the
        // layer's.
        let layer = self
            .layers
            .get_mut(index)?
            .as_mut()
            .as_any_mut()
            .downcast_mut::<L>()?;
        let r = f(layer, &mut io);
        let mut queue = VecDeque::new();
        Self::enqueue(&mut queue, index, io);
        self.run_queue(&mut queue);
        Some(r)
    }

    fn run(&mut self, first: Task) -> Vec<Vec<u8>> {
        let mut queue = VecDeque::new();
        queue.push_back(first);
        self.run_queue(&mut queue)
    }

    fn run_queue(&mut self, queue: &mut VecDeque<Task>) -> Vec<Vec<u8>> {
        let mut delivered = Vec::new();

        while let Some(task) = queue.pop_front() {
            match task {
                Task::Decode { layer, mut data } => {
                    if layer >= self.layers.len() {
                        delivered.push(data);
                        continue;
                    }
                    let mut io = LayerIo::new(self.mtu_below(layer));
                    self.layers[layer].decode(&mut data, &mut io);
                    Self::enqueue(queue, layer, io);
                }
                Task::Encode { layer, data, last } => match layer {
                    None => self.sink(&data, last),
                    Some(i) => {
                        let mut io = LayerIo::new(self.mtu_below(i));
                        self.layers[i].encode(&data, last, &mut io);
                        Self::enqueue(queue, i, io);
                    }
                },
                Task::Flush { layer } => {
                    let mut io = LayerIo::new(self.mtu_below(layer));
                    self.layers[layer].flush(&mut io);
                    Self::enqueue(queue, layer, io);
                    if layer > 0 {
                        queue.push_back(Task::Flush { layer: layer - 1 });
                    }
                }
            }
        }

        delivered
    }

    fn enqueue(queue: &mut VecDeque<Task>, layer: usize, io: LayerIo) {
        for (data, last) in io.down {
            queue.push_back(Task::Encode {
                layer: layer.checked_sub(1),
                data,
                last,
            });
        }
        for data in io.up {
            queue.push_back(Task::Decode {
                layer: layer + 1,
                data,
            });
        }
    }

    fn sink(&mut self, data: &[u8], last: bool) {
        self.tx_partial.extend_from_slice(data);
        if last {
            self.tx.push(std::mem::take(&mut self.tx_partial));
        }
    }
}

impl Responder for ProtocolStack {
    fn write(&mut self, data: &[u8], last: bool) {
        self.encode_partial(data, last);
    }

    fn set_purgeable(&mut self, purgeable: bool) {
        for i in (0..self.layers.len()).rev() {
            let mut io = LayerIo::new(self.mtu_below(i));
            let consumed = self.layers[i].set_purgeable(purgeable, &mut io);
            let mut queue = VecDeque::new();
            Self::enqueue(&mut queue, i, io);
            self.run_queue(&mut queue);
            if consumed {
                break;
            }
        }
    }
}

/// Collects a complete response in memory, for tests and for macro
/// execution where per-segment responses are merged.
#[derive(Default)]
pub struct BufferResponder {
    pub data: Vec<u8>,
}

impl Responder for BufferResponder {
    fn write(&mut self, data: &[u8], _last: bool) {
        self.data.extend_from_slice(data);
    }
}
