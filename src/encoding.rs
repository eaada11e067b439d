//! Little-endian binary persistence.
//!
//! Every framed value is written as `[size: u64][payload]`; a size of
//! `u64::MAX` stands for an absent value. Small payloads are produced into a
//! buffer first so the size is always exact, and decoding reads through a
//! `Take` so a bad size can never make a decoder run past its frame.
//!
//! Tree layout: abstraction id (16 bytes), shared flag, params, root state,
//! global iteration, then the root node. Nodes are a kind byte followed by
//! their payload; a player node lists all of its actions before the child
//! frames, so children are read straight off the stream in preorder. A node
//! reached a second time (through subtree sharing) is written as a reference
//! to the preorder index of its first, fully written occurrence. Trees are
//! never buffered whole: a counting pass sizes every node frame, then the
//! writing pass streams them out behind their sizes.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use log::info;

use crate::abstraction::AbsId;
use crate::error::{SolverError, SolverResult};
use crate::policy::Policy;
use crate::range::Range;
use crate::table::{
    ActionKind, Commitment, DiscreteAction, GameParams, Seat, State, Status, Street,
};
use crate::tree::{Node, NodeKind, PlayerNode, ReferenceNode, Successor, TerminalNode, Tree};

/// Frame size marking an absent value.
pub const NIL: u64 = u64::MAX;

const NIL_LEN: u32 = u32::MAX;

pub trait Encode {
    fn encode(&self, buf: &mut Vec<u8>) -> SolverResult<()>;
}

pub trait Decode: Sized {
    fn decode<R: Read>(r: &mut R) -> SolverResult<Self>;
}

/// Write `value` as `[size][payload]`, or the nil marker for `None`.
pub fn write_framed<W: Write, T: Encode>(w: &mut W, value: Option<&T>) -> SolverResult<()> {
    let Some(value) = value else {
        w.write_u64::<LE>(NIL)?;
        return Ok(());
    };
    let mut payload = Vec::new();
    value.encode(&mut payload)?;
    w.write_u64::<LE>(payload.len() as u64)?;
    w.write_all(&payload)?;
    Ok(())
}

/// Read one framed value; `None` for the nil marker.
pub fn read_framed<R: Read, T: Decode>(r: &mut R) -> SolverResult<Option<T>> {
    let size = r.read_u64::<LE>()?;
    if size == NIL {
        return Ok(None);
    }
    let mut frame = r.by_ref().take(size);
    let value = T::decode(&mut frame)?;
    if frame.limit() != 0 {
        return Err(SolverError::Codec(format!(
            "{} unread bytes in a {} byte frame",
            frame.limit(),
            size
        )));
    }
    Ok(Some(value))
}

fn read_required<R: Read, T: Decode>(r: &mut R, what: &str) -> SolverResult<T> {
    read_framed(r)?.ok_or_else(|| SolverError::Codec(format!("missing {}", what)))
}

/// Encode into a fresh buffer.
pub fn to_bytes<T: Encode>(value: &T) -> SolverResult<Vec<u8>> {
    let mut buf = Vec::new();
    value.encode(&mut buf)?;
    Ok(buf)
}

/// Decode a whole buffer, rejecting trailing bytes.
pub fn from_bytes<T: Decode>(bytes: &[u8]) -> SolverResult<T> {
    let mut r = bytes;
    let value = T::decode(&mut r)?;
    if !r.is_empty() {
        return Err(SolverError::Codec(format!("{} trailing bytes", r.len())));
    }
    Ok(value)
}

/// Byte key identifying a betting state, used to find transposed chance
/// nodes.
pub fn state_key(state: &State) -> SolverResult<Vec<u8>> {
    to_bytes(state)
}

// ---------------------------------------------------------------------------
// Sequences
// ---------------------------------------------------------------------------

fn write_len<W: Write>(buf: &mut W, len: usize) -> SolverResult<()> {
    if len >= NIL_LEN as usize {
        return Err(SolverError::Codec(format!("sequence of {} entries is too long", len)));
    }
    buf.write_u32::<LE>(len as u32)?;
    Ok(())
}

fn read_len<R: Read>(r: &mut R) -> SolverResult<usize> {
    let len = r.read_u32::<LE>()?;
    if len == NIL_LEN {
        return Err(SolverError::Codec("unexpected nil sequence".into()));
    }
    Ok(len as usize)
}

fn write_f64s(buf: &mut Vec<u8>, values: &[f64]) -> SolverResult<()> {
    write_len(buf, values.len())?;
    for v in values {
        buf.write_f64::<LE>(*v)?;
    }
    Ok(())
}

fn read_f64s<R: Read>(r: &mut R) -> SolverResult<Vec<f64>> {
    let len = read_len(r)?;
    let mut values = Vec::new();
    for _ in 0..len {
        values.push(r.read_f64::<LE>()?);
    }
    Ok(values)
}

fn write_f32s(buf: &mut Vec<u8>, values: &[f32]) -> SolverResult<()> {
    write_len(buf, values.len())?;
    for v in values {
        buf.write_f32::<LE>(*v)?;
    }
    Ok(())
}

fn read_f32s<R: Read>(r: &mut R) -> SolverResult<Vec<f32>> {
    let len = read_len(r)?;
    let mut values = Vec::new();
    for _ in 0..len {
        values.push(r.read_f32::<LE>()?);
    }
    Ok(values)
}

fn read_bool<R: Read>(r: &mut R) -> SolverResult<bool> {
    match r.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        v => Err(SolverError::Codec(format!("invalid bool {}", v))),
    }
}

// ---------------------------------------------------------------------------
// Rules types
// ---------------------------------------------------------------------------

impl Encode for GameParams {
    fn encode(&self, buf: &mut Vec<u8>) -> SolverResult<()> {
        buf.write_u8(self.num_players)?;
        buf.write_u8(self.max_actions_per_round)?;
        buf.write_u8(self.btn_pos)?;
        buf.write_f32::<LE>(self.sb_amount)?;
        buf.write_f32::<LE>(self.ante)?;
        write_len(buf, self.bet_sizes.len())?;
        for level in &self.bet_sizes {
            write_f32s(buf, level)?;
        }
        write_f32s(buf, &self.initial_stacks)?;
        buf.write_u8(self.terminal_street as u8)?;
        buf.write_u8(self.min_bet as u8)?;
        buf.write_u8(self.limp as u8)?;
        Ok(())
    }
}

impl Decode for GameParams {
    fn decode<R: Read>(r: &mut R) -> SolverResult<GameParams> {
        let num_players = r.read_u8()?;
        let max_actions_per_round = r.read_u8()?;
        let btn_pos = r.read_u8()?;
        let sb_amount = r.read_f32::<LE>()?;
        let ante = r.read_f32::<LE>()?;
        let levels = read_len(r)?;
        let mut bet_sizes = Vec::new();
        for _ in 0..levels {
            bet_sizes.push(read_f32s(r)?);
        }
        let params = GameParams {
            num_players,
            max_actions_per_round,
            btn_pos,
            sb_amount,
            ante,
            bet_sizes,
            initial_stacks: read_f32s(r)?,
            terminal_street: Street::from_u8(r.read_u8()?)?,
            min_bet: read_bool(r)?,
            limp: read_bool(r)?,
        };
        params.validate()?;
        Ok(params)
    }
}

impl Encode for State {
    fn encode(&self, buf: &mut Vec<u8>) -> SolverResult<()> {
        write_len(buf, self.players.len())?;
        for (i, seat) in self.players.iter().enumerate() {
            buf.write_f32::<LE>(seat.paid)?;
            buf.write_u8(seat.status as u8)?;
            buf.write_f32::<LE>(self.psc[i])?;
            buf.write_u8(self.psac[i])?;
            buf.write_u8(self.psla[i] as u8)?;
        }
        buf.write_u8(self.street as u8)?;
        buf.write_u8(self.turn_pos)?;
        buf.write_u8(self.btn_pos)?;
        buf.write_u8(self.bet_action)?;
        buf.write_u8(self.street_action)?;
        buf.write_f32::<LE>(self.call_amount)?;
        buf.write_f32::<LE>(self.bsc.amount)?;
        buf.write_f32::<LE>(self.bsc.addition)?;
        buf.write_u8(self.bsc.action as u8)?;
        Ok(())
    }
}

impl Decode for State {
    fn decode<R: Read>(r: &mut R) -> SolverResult<State> {
        let n = read_len(r)?;
        let mut players = Vec::with_capacity(n.min(16));
        let mut psc = Vec::with_capacity(n.min(16));
        let mut psac = Vec::with_capacity(n.min(16));
        let mut psla = Vec::with_capacity(n.min(16));
        for _ in 0..n {
            players.push(Seat {
                paid: r.read_f32::<LE>()?,
                status: Status::from_u8(r.read_u8()?)?,
            });
            psc.push(r.read_f32::<LE>()?);
            psac.push(r.read_u8()?);
            psla.push(ActionKind::from_u8(r.read_u8()?)?);
        }
        Ok(State {
            players,
            street: Street::from_u8(r.read_u8()?)?,
            turn_pos: r.read_u8()?,
            btn_pos: r.read_u8()?,
            bet_action: r.read_u8()?,
            street_action: r.read_u8()?,
            call_amount: r.read_f32::<LE>()?,
            bsc: Commitment {
                amount: r.read_f32::<LE>()?,
                addition: r.read_f32::<LE>()?,
                action: ActionKind::from_u8(r.read_u8()?)?,
            },
            psc,
            psac,
            psla,
        })
    }
}

// ---------------------------------------------------------------------------
// Policies and ranges
// ---------------------------------------------------------------------------

impl Encode for Policy {
    /// Refuses to persist non-finite accumulators.
    fn encode(&self, buf: &mut Vec<u8>) -> SolverResult<()> {
        if let Some(corruption) = self.find_corruption() {
            return Err(SolverError::Corrupted(corruption));
        }
        buf.write_u64::<LE>(self.iteration)?;
        write_f64s(buf, &self.regret_sum)?;
        write_f64s(buf, &self.strategy_sum)?;
        write_f64s(buf, &self.baseline)?;
        Ok(())
    }
}

impl Decode for Policy {
    fn decode<R: Read>(r: &mut R) -> SolverResult<Policy> {
        let iteration = r.read_u64::<LE>()?;
        let regret_sum = read_f64s(r)?;
        let strategy_sum = read_f64s(r)?;
        let baseline = read_f64s(r)?;
        let n = regret_sum.len();
        if strategy_sum.len() != n || baseline.len() != n {
            return Err(SolverError::Codec(format!(
                "policy vectors disagree: {} regrets, {} sums, {} baselines",
                n,
                strategy_sum.len(),
                baseline.len()
            )));
        }
        let mut policy = Policy::new(n);
        policy.iteration = iteration;
        policy.regret_sum = regret_sum;
        policy.strategy_sum = strategy_sum;
        policy.baseline = baseline;
        if let Some(corruption) = policy.find_corruption() {
            return Err(SolverError::Corrupted(corruption));
        }
        policy.build_strategy();
        Ok(policy)
    }
}

impl Encode for Range {
    fn encode(&self, buf: &mut Vec<u8>) -> SolverResult<()> {
        if let Some(i) = self.weights.iter().position(|w| !w.is_finite() || *w < 0.0) {
            return Err(SolverError::Corrupted(format!("range[{}] = {}", i, self.weights[i])));
        }
        write_f64s(buf, &self.weights)
    }
}

impl Decode for Range {
    fn decode<R: Read>(r: &mut R) -> SolverResult<Range> {
        Range::from_weights(read_f64s(r)?)
    }
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

const KIND_ROOT: u8 = 0;
const KIND_CHANCE: u8 = 1;
const KIND_PLAYER: u8 = 2;
const KIND_TERMINAL: u8 = 3;
const KIND_REFERENCE: u8 = 4;

/// Preorder positions of nodes already written in full, by arena id.
type Written = HashMap<u32, u32>;

/// Writer that tracks how many bytes went through it.
struct Counted<W> {
    inner: W,
    bytes: u64,
}

impl<W: Write> Counted<W> {
    fn new(inner: W) -> Counted<W> {
        Counted { inner, bytes: 0 }
    }
}

impl<W: Write> Write for Counted<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(data)?;
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Node frame sizes in preorder. Filled by a pass over a sink, then
/// consumed by the pass that writes.
#[derive(Default)]
struct Frames {
    written: Written,
    sizes: Vec<u64>,
    next: usize,
    measuring: bool,
}

impl Frames {
    /// Size every frame of `tree`; returns the frames and the payload size.
    fn measure(tree: &Tree) -> SolverResult<(Frames, u64)> {
        let mut frames = Frames {
            measuring: true,
            ..Frames::default()
        };
        let mut sink = Counted::new(io::sink());
        frames.tree(&mut sink, tree)?;
        frames.measuring = false;
        frames.written.clear();
        Ok((frames, sink.bytes))
    }

    fn tree<W: Write>(&mut self, w: &mut Counted<W>, tree: &Tree) -> SolverResult<()> {
        w.write_all(&tree.abs_id.0)?;
        w.write_u8(tree.is_shared() as u8)?;
        write_framed(w, Some(&tree.params))?;
        write_framed(w, Some(&tree.state))?;
        w.write_u64::<LE>(tree.iteration())?;
        self.node(w, &tree.root)
    }

    fn successor<W: Write>(
        &mut self,
        w: &mut Counted<W>,
        next: Option<&Arc<Node>>,
    ) -> SolverResult<()> {
        let Some(node) = next else {
            w.write_u64::<LE>(NIL)?;
            return Ok(());
        };
        let slot = self.next;
        self.next += 1;
        if self.measuring {
            self.sizes.push(0);
        }
        let size = self
            .sizes
            .get(slot)
            .copied()
            .ok_or_else(|| SolverError::Codec("tree grew while saving".into()))?;
        w.write_u64::<LE>(size)?;
        let start = w.bytes;
        self.node(w, node)?;
        let len = w.bytes - start;
        if self.measuring {
            self.sizes[slot] = len;
        } else if len != size {
            return Err(SolverError::Codec(format!(
                "node frame changed from {} to {} bytes while saving",
                size, len
            )));
        }
        Ok(())
    }

    fn node<W: Write>(&mut self, w: &mut Counted<W>, node: &Arc<Node>) -> SolverResult<()> {
        let node = node.resolve();
        if let Some(index) = self.written.get(&node.id) {
            w.write_u8(KIND_REFERENCE)?;
            w.write_u32::<LE>(*index)?;
            return Ok(());
        }
        let index = self.written.len() as u32;
        self.written.insert(node.id, index);

        match &node.kind {
            NodeKind::Root(s) => {
                w.write_u8(KIND_ROOT)?;
                self.successor(w, s.next.get())?;
            }
            NodeKind::Chance(s) => {
                w.write_u8(KIND_CHANCE)?;
                write_framed(w, Some(&s.state))?;
                self.successor(w, s.next.get())?;
            }
            NodeKind::Player(p) => {
                w.write_u8(KIND_PLAYER)?;
                write_framed(w, Some(&p.state))?;
                let mut policies = p.policies();
                policies.sort_by_key(|(cluster, _)| *cluster);
                write_len(w, policies.len())?;
                for (cluster, policy) in policies {
                    w.write_u32::<LE>(cluster)?;
                    write_framed(w, Some(&*policy.lock()))?;
                }
                w.write_u8(p.num_actions() as u8)?;
                for action in &p.actions {
                    w.write_f32::<LE>(action.0)?;
                }
                for child in &p.children {
                    self.successor(w, child.get())?;
                }
            }
            NodeKind::Terminal(t) => {
                w.write_u8(KIND_TERMINAL)?;
                write_len(w, t.players.len())?;
                for seat in &t.players {
                    w.write_f32::<LE>(seat.paid)?;
                    w.write_u8(seat.status as u8)?;
                }
                w.write_f32::<LE>(t.pot)?;
            }
            // resolve() never returns a reference
            NodeKind::Reference(_) => {
                return Err(SolverError::Codec("unresolved reference node".into()));
            }
        }
        Ok(())
    }
}

/// Stream `tree` as one `[size][payload]` frame without holding the
/// payload in memory.
pub fn write_tree<W: Write>(w: &mut W, tree: &Tree) -> SolverResult<()> {
    let (mut frames, size) = Frames::measure(tree)?;
    w.write_u64::<LE>(size)?;
    let mut out = Counted::new(w);
    frames.tree(&mut out, tree)?;
    if out.bytes != size {
        return Err(SolverError::Codec(format!(
            "tree changed from {} to {} bytes while saving",
            size, out.bytes
        )));
    }
    Ok(())
}

impl Encode for Tree {
    fn encode(&self, buf: &mut Vec<u8>) -> SolverResult<()> {
        let (mut frames, size) = Frames::measure(self)?;
        buf.reserve(size as usize);
        frames.tree(&mut Counted::new(buf), self)
    }
}

impl Decode for Tree {
    fn decode<R: Read>(r: &mut R) -> SolverResult<Tree> {
        let mut abs = [0u8; 16];
        r.read_exact(&mut abs)?;
        let shared = read_bool(r)?;
        let params: GameParams = read_required(r, "game params")?;
        let state: State = read_required(r, "root state")?;
        let iteration = r.read_u64::<LE>()?;

        let mut tree = Tree::from_state(params, state, AbsId(abs));
        if shared {
            tree = tree.with_shared_subtrees();
        }

        let mut decoder = NodeDecoder {
            tree: &tree,
            preorder: Vec::new(),
            policies: 0,
        };
        if r.read_u8()? != KIND_ROOT {
            return Err(SolverError::Codec("tree does not start with a root".into()));
        }
        decoder.preorder.push(Arc::clone(&tree.root));
        if let Some(next) = decoder.successor(r)? {
            if let NodeKind::Root(s) = &tree.root.kind {
                let _ = s.next.set(next);
            }
        }
        let policies = decoder.policies;
        tree.set_counters(iteration, policies);
        Ok(tree)
    }
}

struct NodeDecoder<'t> {
    tree: &'t Tree,
    preorder: Vec<Arc<Node>>,
    policies: u32,
}

impl NodeDecoder<'_> {
    fn successor(&mut self, r: &mut dyn Read) -> SolverResult<Option<Arc<Node>>> {
        let size = r.read_u64::<LE>()?;
        if size == NIL {
            return Ok(None);
        }
        let mut frame = (&mut *r).take(size);
        let node = self.node(&mut frame)?;
        if frame.limit() != 0 {
            return Err(SolverError::Codec("node frame not fully consumed".into()));
        }
        Ok(Some(node))
    }

    fn node(&mut self, mut r: &mut dyn Read) -> SolverResult<Arc<Node>> {
        let r = &mut r;
        match r.read_u8()? {
            KIND_CHANCE => {
                let state: State = read_required(r, "chance state")?;
                let key = if self.tree.is_shared() {
                    Some(state_key(&state)?)
                } else {
                    None
                };
                let node = self.tree.register(NodeKind::Chance(Successor {
                    state,
                    next: Default::default(),
                }));
                if let Some(key) = key {
                    self.tree.remember_shared(key, Arc::clone(&node));
                }
                self.preorder.push(Arc::clone(&node));
                if let Some(next) = self.successor(r)? {
                    if let NodeKind::Chance(s) = &node.kind {
                        let _ = s.next.set(next);
                    }
                }
                Ok(node)
            }
            KIND_PLAYER => {
                let state: State = read_required(r, "player state")?;
                let count = read_len(r)?;
                let mut policies = Vec::new();
                for _ in 0..count {
                    let cluster = r.read_u32::<LE>()?;
                    let policy: Policy = read_required(r, "policy")?;
                    policies.push((cluster, policy));
                }
                let n = r.read_u8()? as usize;
                let mut actions = Vec::with_capacity(n);
                for _ in 0..n {
                    actions.push(DiscreteAction(r.read_f32::<LE>()?));
                }

                let player = PlayerNode::new(state, actions);
                for (cluster, policy) in policies {
                    if policy.len() != player.num_actions() {
                        return Err(SolverError::Codec(format!(
                            "policy for cluster {} has {} actions, node has {}",
                            cluster,
                            policy.len(),
                            player.num_actions()
                        )));
                    }
                    player.insert_policy(cluster, policy);
                    self.policies += 1;
                }
                let node = self.tree.register(NodeKind::Player(player));
                self.preorder.push(Arc::clone(&node));

                if let NodeKind::Player(p) = &node.kind {
                    for slot in &p.children {
                        if let Some(child) = self.successor(r)? {
                            let _ = slot.set(child);
                        }
                    }
                }
                Ok(node)
            }
            KIND_TERMINAL => {
                let n = read_len(r)?;
                let mut players = Vec::with_capacity(n.min(16));
                for _ in 0..n {
                    players.push(Seat {
                        paid: r.read_f32::<LE>()?,
                        status: Status::from_u8(r.read_u8()?)?,
                    });
                }
                let pot = r.read_f32::<LE>()?;
                let node = self.tree.register(NodeKind::Terminal(TerminalNode { players, pot }));
                self.preorder.push(Arc::clone(&node));
                Ok(node)
            }
            KIND_REFERENCE => {
                let index = r.read_u32::<LE>()? as usize;
                let target = self.preorder.get(index).cloned().ok_or_else(|| {
                    SolverError::Codec(format!("reference to unknown node {}", index))
                })?;
                Ok(self.tree.register(NodeKind::Reference(ReferenceNode {
                    target: target.id,
                    node: target,
                })))
            }
            KIND_ROOT => Err(SolverError::Codec("nested root node".into())),
            k => Err(SolverError::Codec(format!("unknown node kind {}", k))),
        }
    }
}

/// Write a tree with its policies to `path`.
pub fn save_tree(tree: &Tree, path: &Path) -> SolverResult<()> {
    let mut w = BufWriter::new(File::create(path)?);
    write_tree(&mut w, tree)?;
    w.flush()?;
    info!(
        "saved tree {} ({} nodes, {} states, iteration {}) to {}",
        tree.abs_id,
        tree.nodes(),
        tree.states(),
        tree.iteration(),
        path.display()
    );
    Ok(())
}

/// Read a tree from `path`, refusing one built for another abstraction.
pub fn load_tree(path: &Path, expected: AbsId) -> SolverResult<Tree> {
    let mut r = BufReader::new(File::open(path)?);
    let tree: Tree = read_required(&mut r, "tree")?;
    if tree.abs_id != expected {
        return Err(SolverError::AbstractionMismatch {
            tree: tree.abs_id.to_string(),
            mapper: expected.to_string(),
        });
    }
    info!(
        "loaded tree {} ({} nodes, {} states, iteration {})",
        tree.abs_id,
        tree.nodes(),
        tree.states(),
        tree.iteration()
    );
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstraction::KUHN_ABS_ID;

    #[test]
    fn nil_frames_decode_to_none() {
        let mut buf = Vec::new();
        write_framed::<_, Policy>(&mut buf, None).unwrap();
        assert_eq!(buf, NIL.to_le_bytes());
        let back: Option<Policy> = read_framed(&mut buf.as_slice()).unwrap();
        assert!(back.is_none());
    }

    #[test]
    fn policy_survives_encoding() {
        let mut p = Policy::new(3);
        p.iteration = 7;
        p.regret_sum = vec![1.0, -2.0, 3.0];
        p.strategy_sum = vec![0.5, 0.25, 0.25];
        p.baseline = vec![0.1, 0.2, -0.3];
        p.build_strategy();

        let mut buf = Vec::new();
        write_framed(&mut buf, Some(&p)).unwrap();
        let back: Policy = read_framed(&mut buf.as_slice()).unwrap().unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn corrupted_policy_is_not_persisted() {
        let mut p = Policy::new(2);
        p.regret_sum[0] = f64::INFINITY;
        let err = to_bytes(&p).unwrap_err();
        assert!(matches!(err, SolverError::Corrupted(_)), "{}", err);
    }

    #[test]
    fn frame_size_must_match_payload() {
        let p = Policy::new(2);
        let mut buf = Vec::new();
        write_framed(&mut buf, Some(&p)).unwrap();
        buf.extend_from_slice(&[0, 0, 0]);
        let size = u64::from_le_bytes(buf[..8].try_into().unwrap()) + 3;
        buf[..8].copy_from_slice(&size.to_le_bytes());
        assert!(read_framed::<_, Policy>(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn params_and_state_round_trip() {
        let params = GameParams::new(3, 150.0, 0.5);
        let state = State::new(&params).unwrap();
        let p2: GameParams = from_bytes(&to_bytes(&params).unwrap()).unwrap();
        let s2: State = from_bytes(&to_bytes(&state).unwrap()).unwrap();
        assert_eq!(p2, params);
        assert_eq!(s2, state);
    }

    #[test]
    fn state_keys_distinguish_states() {
        let params = GameParams::kuhn();
        let a = State::new(&params).unwrap();
        let mut b = a.clone();
        b.turn_pos = 1;
        assert_eq!(state_key(&a).unwrap(), state_key(&a.clone()).unwrap());
        assert_ne!(state_key(&a).unwrap(), state_key(&b).unwrap());
    }

    #[test]
    fn tree_with_policies_round_trips() {
        let tree = Tree::new(GameParams::kuhn(), KUHN_ABS_ID).unwrap();
        tree.expand_full(&tree.root).unwrap();
        let first = tree.decision_point(&tree.root).unwrap();
        let p = first.as_player().unwrap();
        tree.acquire_policy(p, 1).lock().add_regret(1.0, &[0.5, -0.5]);
        tree.iteration.store(42, std::sync::atomic::Ordering::Relaxed);

        let bytes = to_bytes(&tree).unwrap();
        let back: Tree = from_bytes(&bytes).unwrap();
        assert_eq!(back.nodes(), tree.nodes());
        assert_eq!(back.iteration(), 42);
        assert_eq!(back.states(), 1);
        assert_eq!(back.abs_id, KUHN_ABS_ID);

        let first = back.decision_point(&back.root).unwrap();
        let policy = first.as_player().unwrap().policy(1).unwrap();
        assert_eq!(policy.lock().regret_sum, vec![0.5, -0.5]);
        assert_eq!(to_bytes(&back).unwrap(), bytes);
    }

    #[test]
    fn shared_nodes_are_written_once() {
        let mut params = GameParams::new(2, 100.0, 1.0);
        params.terminal_street = Street::Flop;
        params.limp = true;
        params.max_actions_per_round = 3;
        params.bet_sizes = vec![vec![0.5, 1.0]];
        let tree = Tree::new(params, AbsId::default()).unwrap().with_shared_subtrees();
        tree.expand_full(&tree.root).unwrap();

        let back: Tree = from_bytes(&to_bytes(&tree).unwrap()).unwrap();
        assert_eq!(back.nodes(), tree.nodes());
        assert!(back.is_shared());
    }

    /// Keeps every byte but remembers the largest single write.
    #[derive(Default)]
    struct Recorder {
        bytes: Vec<u8>,
        largest: usize,
    }

    impl Write for Recorder {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.largest = self.largest.max(data.len());
            self.bytes.extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Hands out at most three bytes per read.
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let n = out.len().min(3).min(self.0.len());
            out[..n].copy_from_slice(&self.0[..n]);
            self.0 = &self.0[n..];
            Ok(n)
        }
    }

    #[test]
    fn trees_stream_node_by_node() {
        let tree = Tree::new(GameParams::kuhn(), KUHN_ABS_ID).unwrap();
        tree.expand_full(&tree.root).unwrap();
        let first = tree.decision_point(&tree.root).unwrap();
        tree.acquire_policy(first.as_player().unwrap(), 2)
            .lock()
            .add_regret(1.0, &[0.25, -0.25]);

        let mut out = Recorder::default();
        write_tree(&mut out, &tree).unwrap();
        let mut framed = Vec::new();
        write_framed(&mut framed, Some(&tree)).unwrap();
        assert_eq!(out.bytes, framed);
        assert!(out.largest * 4 < out.bytes.len(), "{} of {}", out.largest, out.bytes.len());

        let back: Tree = read_framed(&mut Trickle(&out.bytes)).unwrap().unwrap();
        assert_eq!(back.nodes(), tree.nodes());
        let first = back.decision_point(&back.root).unwrap();
        let policy = first.as_player().unwrap().policy(2).unwrap();
        assert_eq!(policy.lock().regret_sum, vec![0.25, -0.25]);
    }

    #[test]
    fn load_refuses_other_abstraction() {
        let dir = std::env::temp_dir().join(format!("gto-enc-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("kuhn.bin");
        let tree = Tree::new(GameParams::kuhn(), KUHN_ABS_ID).unwrap();
        save_tree(&tree, &path).unwrap();
        assert!(load_tree(&path, KUHN_ABS_ID).is_ok());
        let err = load_tree(&path, AbsId::from_name("other")).unwrap_err();
        assert!(matches!(err, SolverError::AbstractionMismatch { .. }));
        std::fs::remove_dir_all(&dir).ok();
    }
}
