//! Interest-management core for a spatial simulation partition.
//!
//! A [`Space`] owns the entity registry, the symmetric witness graph, the
//! fidelity-tier bookkeeping that drives property replication, proximity
//! traps, and the movement facade. Perception changes are computed from
//! dirty entities each [`Space::step`] and surfaced to a pluggable
//! [`ReplicationSink`] as [`WitnessEvent`]s.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sightline_index::{SpatialQuery, UniformGridIndex};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, warn};

new_key_type! {
    /// Stable generational handle for an entity slot.
    pub struct EntityId;
}

/// Convenience alias for secondary storage keyed by [`EntityId`].
pub type EntityMap<T> = SecondaryMap<EntityId, T>;

/// Number of fidelity tiers an observer can hold toward an observed entity.
pub const DETAIL_TIERS: usize = 4;

/// Number of tiers that carry seen flags and pending change logs.
///
/// The extreme tier receives no property traffic, so nothing is logged for
/// observers parked there; returning from it always resyncs in full.
pub const LOGGED_TIERS: usize = 3;

/// Monotonically increasing simulation clock (steps processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Tick zero, the state before any step has run.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// World-space position in continuous coordinates.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position {
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to `other`.
    #[must_use]
    pub fn distance(self, other: Position) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    fn as_tuple(self) -> (f32, f32, f32) {
        (self.x, self.y, self.z)
    }
}

/// Facing expressed as yaw, pitch, and roll in radians.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Direction {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

impl Direction {
    #[must_use]
    pub const fn new(yaw: f32, pitch: f32, roll: f32) -> Self {
        Self { yaw, pitch, roll }
    }

    fn is_finite(self) -> bool {
        self.yaw.is_finite() && self.pitch.is_finite() && self.roll.is_finite()
    }
}

/// Fidelity tier an observer holds toward an observed entity, tightest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Tier {
    /// Full-rate replication of every detail level.
    Near = 0,
    /// Mid-resolution replication.
    Mid = 1,
    /// Coarse replication.
    Far = 2,
    /// Presence only; no property traffic at all.
    Extreme = 3,
}

impl Tier {
    /// All tiers, tightest first.
    pub const ALL: [Tier; DETAIL_TIERS] = [Tier::Near, Tier::Mid, Tier::Far, Tier::Extreme];

    /// Partition slot for this tier.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// True for tiers that carry seen flags and pending change logs.
    #[must_use]
    pub const fn is_logged(self) -> bool {
        (self as usize) < LOGGED_TIERS
    }
}

/// One tier boundary: the entry radius plus the exit margin beyond it.
///
/// An observer crosses inward when its distance drops strictly below
/// `radius` and back out only when the distance strictly exceeds
/// `radius + hysteresis`. Equality with either threshold holds the current
/// tier, which keeps an entity parked exactly on a boundary from
/// oscillating.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TierBand {
    /// Entry threshold in world units.
    pub radius: f32,
    /// Extra slack beyond `radius` before the tier is given back up.
    pub hysteresis: f32,
}

impl TierBand {
    #[must_use]
    pub const fn new(radius: f32, hysteresis: f32) -> Self {
        Self { radius, hysteresis }
    }
}

/// Distance thresholds separating the four fidelity tiers.
///
/// `bands[0]` divides near from mid, `bands[1]` mid from far, `bands[2]`
/// far from extreme. Radii must increase strictly from band to band.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TierProfile {
    pub bands: [TierBand; LOGGED_TIERS],
}

impl Default for TierProfile {
    fn default() -> Self {
        Self {
            bands: [
                TierBand::new(20.0, 2.0),
                TierBand::new(60.0, 4.0),
                TierBand::new(150.0, 8.0),
            ],
        }
    }
}

impl TierProfile {
    /// Validates band ordering and values.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        let mut previous = 0.0f32;
        for band in &self.bands {
            if !band.radius.is_finite() || band.radius <= 0.0 {
                return Err(DescriptorError::InvalidTierProfile(
                    "band radius must be positive and finite",
                ));
            }
            if !band.hysteresis.is_finite() || band.hysteresis < 0.0 {
                return Err(DescriptorError::InvalidTierProfile(
                    "band hysteresis must be non-negative and finite",
                ));
            }
            if band.radius <= previous {
                return Err(DescriptorError::InvalidTierProfile(
                    "band radii must increase strictly",
                ));
            }
            previous = band.radius;
        }
        Ok(())
    }

    /// Classifies a fresh observation. No hysteresis applies on first entry.
    #[must_use]
    pub fn classify_entry(&self, distance: f32) -> Tier {
        for (slot, band) in self.bands.iter().enumerate() {
            if distance < band.radius {
                return Tier::ALL[slot];
            }
        }
        Tier::Extreme
    }

    /// Re-classifies an existing observation, holding the current tier while
    /// the distance sits inside a hysteresis band.
    #[must_use]
    pub fn reclassify(&self, current: Tier, distance: f32) -> Tier {
        for slot in 0..current.index().min(LOGGED_TIERS) {
            if distance < self.bands[slot].radius {
                return Tier::ALL[slot];
            }
        }
        let mut tier = current;
        while tier.index() < LOGGED_TIERS {
            let band = self.bands[tier.index()];
            if distance > band.radius + band.hysteresis {
                tier = Tier::ALL[tier.index() + 1];
            } else {
                break;
            }
        }
        tier
    }
}

/// Stable numeric key identifying one replicated property in a schema.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyKey(pub u32);

/// Who receives live updates when a property changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PropertyScope {
    /// Server-side only; never replicated anywhere.
    Private,
    /// Delivered to the entity's own client only.
    OwnClient,
    /// Delivered to observing clients but never the own client.
    OtherClients,
    /// Delivered to observing clients and the own client.
    AllClients,
}

impl PropertyScope {
    /// True when observers receive this property and tier logging applies.
    #[must_use]
    pub const fn broadcasts(self) -> bool {
        matches!(self, Self::OtherClients | Self::AllClients)
    }

    /// True when the entity's own client receives this property.
    #[must_use]
    pub const fn includes_own_client(self) -> bool {
        matches!(self, Self::OwnClient | Self::AllClients)
    }
}

/// Schema entry for one replicated property.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PropertyDef {
    /// Key quoted by change notifications.
    pub key: PropertyKey,
    /// Human-readable name used in diagnostics.
    pub name: String,
    /// Replication scope.
    pub scope: PropertyScope,
    /// Coarsest tier that still receives this property live.
    pub lod: Tier,
}

impl PropertyDef {
    #[must_use]
    pub fn new(key: u32, name: impl Into<String>, scope: PropertyScope, lod: Tier) -> Self {
        Self {
            key: PropertyKey(key),
            name: name.into(),
            scope,
            lod,
        }
    }
}

/// Errors raised while building an [`EntityDescriptor`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    /// A tier band was malformed or out of order.
    #[error("invalid tier profile: {0}")]
    InvalidTierProfile(&'static str),
    /// Two properties share the same key.
    #[error("duplicate property key {0}")]
    DuplicateProperty(u32),
    /// A broadcast property names the extreme tier as its detail level.
    #[error("property {0} cannot use the extreme tier as a detail level")]
    ExtremeDetailLevel(u32),
}

/// Validated per-type schema: tier thresholds plus the property table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityDescriptor {
    type_name: String,
    tiers: TierProfile,
    properties: Vec<PropertyDef>,
}

impl EntityDescriptor {
    /// Builds and validates a descriptor.
    pub fn new(
        type_name: impl Into<String>,
        tiers: TierProfile,
        properties: Vec<PropertyDef>,
    ) -> Result<Self, DescriptorError> {
        tiers.validate()?;
        let mut keys = HashSet::with_capacity(properties.len());
        for property in &properties {
            if !keys.insert(property.key) {
                return Err(DescriptorError::DuplicateProperty(property.key.0));
            }
            if property.scope.broadcasts() && !property.lod.is_logged() {
                return Err(DescriptorError::ExtremeDetailLevel(property.key.0));
            }
        }
        Ok(Self {
            type_name: type_name.into(),
            tiers,
            properties,
        })
    }

    /// Descriptor with no replicated properties, for simple entity types.
    pub fn bare(type_name: impl Into<String>, tiers: TierProfile) -> Result<Self, DescriptorError> {
        Self::new(type_name, tiers, Vec::new())
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[must_use]
    pub const fn tiers(&self) -> &TierProfile {
        &self.tiers
    }

    #[must_use]
    pub fn properties(&self) -> &[PropertyDef] {
        &self.properties
    }

    /// Looks up a property by key. Schemas are small, so a linear scan is fine.
    #[must_use]
    pub fn property(&self, key: PropertyKey) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.key == key)
    }
}

/// Opaque routing token locating one of an entity's remote representations.
///
/// The core never interprets the token; it only tests presence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RemoteHandle(pub u64);

/// Per-observer bookkeeping owned by the observed entity.
///
/// Tracks the observer's current tier, the distance recorded at the last
/// evaluation, which detail levels have ever been delivered at full
/// resolution, and the property keys that changed while a level was out of
/// live range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WitnessRecord {
    tier: Tier,
    range: f32,
    seen: [bool; LOGGED_TIERS],
    pending: [Vec<PropertyKey>; LOGGED_TIERS],
}

impl WitnessRecord {
    /// Record for an observer entering at `tier`.
    ///
    /// Entry delivers a snapshot of every level visible from `tier`, so all
    /// levels at or looser than the entry tier start out seen.
    #[must_use]
    pub fn new(tier: Tier, range: f32) -> Self {
        let mut seen = [false; LOGGED_TIERS];
        for (level, flag) in seen.iter_mut().enumerate() {
            *flag = level >= tier.index();
        }
        Self {
            tier,
            range,
            seen,
            pending: Default::default(),
        }
    }

    /// Observer's current fidelity tier.
    #[must_use]
    pub const fn tier(&self) -> Tier {
        self.tier
    }

    /// Distance recorded at the last evaluation.
    #[must_use]
    pub const fn range(&self) -> f32 {
        self.range
    }

    /// Whether detail level `level` has ever been delivered to this observer.
    #[must_use]
    pub fn has_seen(&self, level: Tier) -> bool {
        level.is_logged() && self.seen[level.index()]
    }

    /// Property keys queued for replay at detail level `level`.
    #[must_use]
    pub fn pending(&self, level: Tier) -> &[PropertyKey] {
        if level.is_logged() {
            &self.pending[level.index()]
        } else {
            &[]
        }
    }

    fn set_range(&mut self, range: f32) {
        self.range = range;
    }

    /// Queues a change for later replay if this level was delivered before.
    /// Levels never seen need no log; they get a full snapshot on arrival.
    fn log_change(&mut self, level: Tier, key: PropertyKey) {
        if level.is_logged() && self.seen[level.index()] {
            self.pending[level.index()].push(key);
        }
    }

    /// Moves the record to `new`, returning the resync work each freshly
    /// visible level requires. Loosening within the logged tiers keeps
    /// flags and logs untouched; loosening into the extreme tier discards
    /// them, since nothing is logged there and anything cached goes stale.
    /// Every return from extreme therefore resyncs in full, level by level.
    fn retier(&mut self, new: Tier) -> SmallVec<[LevelResync; LOGGED_TIERS]> {
        let old = self.tier;
        self.tier = new;
        let mut resync = SmallVec::new();
        if new >= old {
            if new == Tier::Extreme {
                self.seen = [false; LOGGED_TIERS];
                for log in &mut self.pending {
                    log.clear();
                }
            }
            return resync;
        }
        for slot in new.index()..old.index().min(LOGGED_TIERS) {
            let level = Tier::ALL[slot];
            if !self.seen[slot] {
                self.seen[slot] = true;
                self.pending[slot].clear();
                resync.push(LevelResync {
                    level,
                    kind: ResyncKind::Full,
                });
            } else if !self.pending[slot].is_empty() {
                let keys = std::mem::take(&mut self.pending[slot]);
                resync.push(LevelResync {
                    level,
                    kind: ResyncKind::Differential(keys),
                });
            }
        }
        resync
    }
}

/// Resync action the replication layer must take for one detail level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ResyncKind {
    /// Send a full snapshot of the level's properties.
    Full,
    /// Replay the listed property keys in their original change order.
    Differential(Vec<PropertyKey>),
}

/// Per-level resync decision attached to a tier change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LevelResync {
    pub level: Tier,
    pub kind: ResyncKind,
}

/// Identifies a proximity trap registered on its owner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TrapId(pub u16);

/// Identifies one movement request; completions must quote it back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MoveTicket(pub u32);

/// Movement request kinds understood by the executor collaborator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum MoveCommand {
    /// Straight-line motion toward a destination.
    Point {
        destination: Position,
        face_movement: bool,
        move_vertically: bool,
    },
    /// One navigation-mesh step toward a destination.
    NavigateStep {
        destination: Position,
        max_move_distance: f32,
        max_distance: f32,
        face_movement: bool,
        girth: f32,
    },
}

impl MoveCommand {
    /// True when the command may change the vertical coordinate: point moves
    /// with `move_vertically` set, and navigation steps, which follow the
    /// mesh height. Such requests are clamped by the vertical cap as well.
    #[must_use]
    pub const fn moves_vertically(self) -> bool {
        match self {
            Self::Point {
                move_vertically, ..
            } => move_vertically,
            Self::NavigateStep { .. } => true,
        }
    }
}

/// Fully validated movement request handed to the executor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MoveRequest {
    /// What kind of motion to execute.
    pub command: MoveCommand,
    /// Requested speed in world units, already clamped to every applicable
    /// top-speed cap.
    pub velocity: f32,
    /// Caller-supplied context echoed in the completion event.
    pub context: u64,
    /// Ticket identifying this request for completion matching.
    pub ticket: MoveTicket,
}

/// Domain events surfaced to the replication sink.
///
/// Events appear in the order the core committed the corresponding state,
/// so a sink replaying them reconstructs every intermediate graph.
#[derive(Debug, Clone, PartialEq)]
pub enum WitnessEvent {
    /// `observer` began viewing `entity` at `tier`.
    ViewEnter {
        observer: EntityId,
        entity: EntityId,
        tier: Tier,
        range: f32,
    },
    /// `observer` stopped viewing `entity`.
    ViewLeave { observer: EntityId, entity: EntityId },
    /// `observer`'s fidelity toward `entity` crossed a tier boundary.
    TierChange {
        observer: EntityId,
        entity: EntityId,
        from: Tier,
        to: Tier,
        resync: SmallVec<[LevelResync; LOGGED_TIERS]>,
    },
    /// `entity` gained `observer` in its witness partitions.
    WitnessAdded {
        entity: EntityId,
        observer: EntityId,
        tier: Tier,
        range: f32,
    },
    /// `entity` lost `observer` from its witness partitions.
    WitnessRemoved { entity: EntityId, observer: EntityId },
    /// `entity` went from unwatched to watched.
    WitnessedAcquired { entity: EntityId },
    /// `entity` no longer has any observer.
    WitnessedLost { entity: EntityId },
    /// `entity` was granted the ability to observe.
    WitnessGranted { entity: EntityId },
    /// `entity` had its ability to observe revoked.
    WitnessRevoked { entity: EntityId },
    /// `entity` crossed into one of `owner`'s traps.
    TrapEnter {
        owner: EntityId,
        trap: TrapId,
        entity: EntityId,
        range: f32,
    },
    /// A live `entity` left one of `owner`'s traps.
    TrapLeave {
        owner: EntityId,
        trap: TrapId,
        entity: EntityId,
        range: f32,
    },
    /// A trap occupant that can no longer be dereferenced was evicted.
    TrapLeaveById {
        owner: EntityId,
        trap: TrapId,
        entity: EntityId,
    },
    /// A replicated property changed. `observers` is the live audience at
    /// delivery resolution; looser observers were logged instead.
    PropertyChanged {
        entity: EntityId,
        property: PropertyKey,
        own_client: bool,
        observers: Vec<EntityId>,
    },
    /// The in-flight movement request finished.
    MoveCompleted { entity: EntityId, context: u64 },
    /// `entity` was destroyed and all of its graph edges severed.
    Destroyed { entity: EntityId },
}

/// Sink receiving interest transitions after each step or mutating call.
pub trait ReplicationSink: Send {
    fn on_events(&mut self, tick: Tick, events: &[WitnessEvent]);
}

/// Replication sink that swallows all events.
#[derive(Debug, Default)]
pub struct NullReplication;

impl ReplicationSink for NullReplication {
    fn on_events(&mut self, _tick: Tick, _events: &[WitnessEvent]) {}
}

/// Collaborator performing actual path following for movement requests.
///
/// The core owns request lifecycle (tickets, supersession, completion
/// matching); the executor owns the physics. A `begin` for an entity with a
/// request already in flight supersedes it.
pub trait MovementExecutor: Send {
    /// Begins executing `request` for `entity`.
    fn begin(&mut self, entity: EntityId, request: &MoveRequest);
    /// Cancels whatever `entity` is currently executing.
    fn cancel(&mut self, entity: EntityId);
}

/// Movement executor that performs no motion.
#[derive(Debug, Default)]
pub struct NullMovement;

impl MovementExecutor for NullMovement {
    fn begin(&mut self, _entity: EntityId, _request: &MoveRequest) {}
    fn cancel(&mut self, _entity: EntityId) {}
}

/// Errors surfaced synchronously by entity operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntityError {
    /// A supplied value was malformed; nothing was mutated.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The operation requires the authoritative instance, not a replica.
    #[error("entity is not authoritative on this partition")]
    NotReal,
    /// A value-returning request targeted an entity already destroyed.
    #[error("entity is already destroyed")]
    AlreadyDestroyed,
    /// The handle does not resolve to a live slot.
    #[error("no entity for handle")]
    NotFound,
}

/// Outcome of an AOI resize, in terms of total retention reach.
///
/// Growth only takes effect at the next step; callers wanting an immediate
/// rescan can follow up with [`Space::reevaluate`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AoiResize {
    Grew,
    Shrank,
    Unchanged,
}

/// Initial state for a spawned entity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EntitySeed {
    /// Spawn position.
    pub position: Position,
    /// Spawn facing.
    pub direction: Direction,
    /// Whether this is the authoritative instance or a ghost replica.
    pub real: bool,
    /// Whether the entity may observe others.
    pub witness: bool,
}

impl Default for EntitySeed {
    fn default() -> Self {
        Self {
            position: Position::default(),
            direction: Direction::default(),
            real: true,
            witness: false,
        }
    }
}

impl EntitySeed {
    /// Seed at `position` with defaults elsewhere.
    #[must_use]
    pub fn at(position: Position) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }
}

/// A simulated actor registered in a [`Space`].
///
/// All mutation goes through [`Space`] methods so the witness graph stays
/// symmetric; this type only exposes read access.
#[derive(Debug, Clone)]
pub struct Entity {
    id: EntityId,
    descriptor: Arc<EntityDescriptor>,
    position: Position,
    direction: Direction,
    real: bool,
    destroyed: bool,
    aoi_radius: f32,
    aoi_hysteresis: f32,
    witnessed: bool,
    has_witness: bool,
    view: HashSet<EntityId>,
    witnessed_by: [HashMap<EntityId, WitnessRecord>; DETAIL_TIERS],
    top_speed: f32,
    top_speed_y: f32,
    base_handle: Option<RemoteHandle>,
    client_handle: Option<RemoteHandle>,
}

impl Entity {
    #[must_use]
    pub const fn id(&self) -> EntityId {
        self.id
    }

    #[must_use]
    pub fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub const fn position(&self) -> Position {
        self.position
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether this partition holds the authoritative instance.
    #[must_use]
    pub const fn is_real(&self) -> bool {
        self.real
    }

    #[must_use]
    pub const fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Whether at least one observer currently watches this entity.
    #[must_use]
    pub const fn is_witnessed(&self) -> bool {
        self.witnessed
    }

    /// Whether this entity may observe others.
    #[must_use]
    pub const fn has_witness(&self) -> bool {
        self.has_witness
    }

    #[must_use]
    pub const fn aoi_radius(&self) -> f32 {
        self.aoi_radius
    }

    #[must_use]
    pub const fn aoi_hysteresis(&self) -> f32 {
        self.aoi_hysteresis
    }

    /// Total retention reach: interest radius plus hysteresis margin.
    #[must_use]
    pub fn reach(&self) -> f32 {
        self.aoi_radius + self.aoi_hysteresis
    }

    #[must_use]
    pub const fn top_speed(&self) -> f32 {
        self.top_speed
    }

    #[must_use]
    pub const fn top_speed_y(&self) -> f32 {
        self.top_speed_y
    }

    #[must_use]
    pub const fn base_handle(&self) -> Option<RemoteHandle> {
        self.base_handle
    }

    #[must_use]
    pub const fn client_handle(&self) -> Option<RemoteHandle> {
        self.client_handle
    }

    /// Entities currently inside this entity's view.
    #[must_use]
    pub fn view(&self) -> &HashSet<EntityId> {
        &self.view
    }

    /// Number of observers across all tier partitions.
    #[must_use]
    pub fn witness_count(&self) -> usize {
        self.witnessed_by.iter().map(HashMap::len).sum()
    }

    /// Record held for `observer`, if it watches this entity.
    #[must_use]
    pub fn witness_record(&self, observer: EntityId) -> Option<&WitnessRecord> {
        self.witnessed_by.iter().find_map(|p| p.get(&observer))
    }

    /// Observer ids in the partition for `tier`.
    pub fn witnesses_at(&self, tier: Tier) -> impl Iterator<Item = EntityId> + '_ {
        self.witnessed_by[tier.index()].keys().copied()
    }

    /// Observer ids across all partitions.
    pub fn witnesses(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.witnessed_by.iter().flat_map(|p| p.keys().copied())
    }

    fn witness_record_mut(&mut self, observer: EntityId) -> Option<&mut WitnessRecord> {
        self.witnessed_by.iter_mut().find_map(|p| p.get_mut(&observer))
    }

    fn insert_witness(&mut self, observer: EntityId, record: WitnessRecord) {
        self.witnessed_by[record.tier().index()].insert(observer, record);
    }

    fn remove_witness(&mut self, observer: EntityId) -> Option<WitnessRecord> {
        self.witnessed_by.iter_mut().find_map(|p| p.remove(&observer))
    }

    fn any_witness(&self) -> bool {
        self.witnessed_by.iter().any(|p| !p.is_empty())
    }
}

/// Observer-owned radius trigger, independent of the perception graph.
#[derive(Debug, Clone)]
struct ProximityTrap {
    id: TrapId,
    radius: f32,
    occupants: HashSet<EntityId>,
}

/// In-flight movement request.
#[derive(Debug, Clone, Copy)]
struct ActiveMove {
    ticket: MoveTicket,
    context: u64,
}

/// Engine-side state tracked per entity, separate from the data model.
#[derive(Debug, Default)]
struct EntityRuntime {
    dirty: bool,
    traps: SmallVec<[ProximityTrap; 2]>,
    next_trap: u16,
    motion: Option<ActiveMove>,
    move_seq: u32,
}

/// Errors that can occur when constructing a [`Space`].
#[derive(Debug, Error)]
pub enum SpaceError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Static configuration for a spatial partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceConfig {
    /// Edge length of the spatial index's grid cells, in world units.
    pub index_cell_size: f32,
    /// Number of recent tick summaries retained in memory.
    pub history_capacity: usize,
    /// Default linear top speed for spawned entities; zero disables the cap.
    pub default_top_speed: f32,
    /// Default vertical top speed for spawned entities; zero disables the cap.
    pub default_top_speed_y: f32,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            index_cell_size: 60.0,
            history_capacity: 256,
            default_top_speed: 0.0,
            default_top_speed_y: 0.0,
        }
    }
}

impl SpaceConfig {
    /// Validates configuration values.
    pub fn validate(&self) -> Result<(), SpaceError> {
        if !self.index_cell_size.is_finite() || self.index_cell_size <= 0.0 {
            return Err(SpaceError::InvalidConfig("index_cell_size must be positive"));
        }
        if self.history_capacity == 0 {
            return Err(SpaceError::InvalidConfig("history_capacity must be non-zero"));
        }
        if !self.default_top_speed.is_finite() || self.default_top_speed < 0.0 {
            return Err(SpaceError::InvalidConfig(
                "default_top_speed must be non-negative",
            ));
        }
        if !self.default_top_speed_y.is_finite() || self.default_top_speed_y < 0.0 {
            return Err(SpaceError::InvalidConfig(
                "default_top_speed_y must be non-negative",
            ));
        }
        Ok(())
    }
}

/// Counters emitted after processing one step.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickReport {
    pub tick: Tick,
    /// Dirty entities evaluated this step.
    pub evaluated: usize,
    pub enters: usize,
    pub leaves: usize,
    pub tier_changes: usize,
    pub trap_enters: usize,
    pub trap_leaves: usize,
    /// Destroyed slots reclaimed at the end of the step.
    pub reclaimed: usize,
}

/// Point-in-time summary retained in the in-memory history ring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickSummary {
    pub tick: Tick,
    pub entity_count: usize,
    pub observer_count: usize,
    pub witnessed_count: usize,
    /// Directed view edges in the witness graph.
    pub edge_count: usize,
    pub enters: usize,
    pub leaves: usize,
    pub tier_changes: usize,
}

/// Interest transition proposed by the classification pass.
///
/// Proposals are computed in parallel against a positional snapshot and
/// re-validated against live state when applied, so duplicates and entries
/// invalidated by an earlier application degrade to no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    /// `observer` should start viewing `target`.
    Enter { observer: EntityId, target: EntityId },
    /// An existing edge needs its tier and range re-evaluated.
    Refresh { observer: EntityId, target: EntityId },
    /// `observer` should stop viewing `target`.
    Leave { observer: EntityId, target: EntityId },
}

/// Positional snapshot shared by one classification pass.
struct InterestFrame {
    /// Live entity ids in index order; query results map back through this.
    handles: Vec<EntityId>,
    /// Largest retention reach among live observers, for reverse queries.
    max_reach: f32,
}

impl InterestFrame {
    fn empty() -> Self {
        Self {
            handles: Vec::new(),
            max_reach: 0.0,
        }
    }
}

/// Owning registry and step driver for one spatial partition.
///
/// `Space` is the only mutation path into the witness graph. Positional and
/// interest changes mark entities dirty; [`Space::step`] turns accumulated
/// dirt into enter, leave, and tier-change transitions and forwards the
/// resulting events to the replication sink.
pub struct Space {
    config: SpaceConfig,
    tick: Tick,
    entities: SlotMap<EntityId, Entity>,
    runtime: EntityMap<EntityRuntime>,
    index: Box<dyn SpatialQuery>,
    replication: Box<dyn ReplicationSink>,
    movement: Box<dyn MovementExecutor>,
    outbox: Vec<WitnessEvent>,
    pending_reclaim: Vec<EntityId>,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Space")
            .field("tick", &self.tick)
            .field("entities", &self.entities.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Space {
    /// Creates a space with a null replication sink.
    pub fn new(config: SpaceConfig) -> Result<Self, SpaceError> {
        Self::with_replication(config, Box::new(NullReplication))
    }

    /// Creates a space delivering events to `replication`.
    pub fn with_replication(
        config: SpaceConfig,
        replication: Box<dyn ReplicationSink>,
    ) -> Result<Self, SpaceError> {
        config.validate()?;
        let index = Box::new(UniformGridIndex::new(config.index_cell_size));
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            tick: Tick::zero(),
            entities: SlotMap::with_key(),
            runtime: SecondaryMap::new(),
            index,
            replication,
            movement: Box::new(NullMovement),
            outbox: Vec::new(),
            pending_reclaim: Vec::new(),
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    /// Replaces the replication sink.
    pub fn set_replication(&mut self, replication: Box<dyn ReplicationSink>) {
        self.replication = replication;
    }

    /// Replaces the movement executor.
    pub fn set_movement(&mut self, movement: Box<dyn MovementExecutor>) {
        self.movement = movement;
    }

    /// Replaces the spatial index implementation.
    pub fn set_index(&mut self, index: Box<dyn SpatialQuery>) {
        self.index = index;
    }

    #[must_use]
    pub const fn config(&self) -> &SpaceConfig {
        &self.config
    }

    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Read access to an entity, including destroyed ones awaiting reclaim.
    #[must_use]
    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(id)
    }

    /// Number of live entities (destroyed-but-unreclaimed excluded).
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.values().filter(|e| !e.destroyed).count()
    }

    /// Iterates all registered entities.
    pub fn entities(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.entities.iter()
    }

    /// Recent tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Occupants of `trap` on `id`, if both exist.
    #[must_use]
    pub fn trap_occupants(&self, id: EntityId, trap: TrapId) -> Option<&HashSet<EntityId>> {
        self.runtime
            .get(id)?
            .traps
            .iter()
            .find(|t| t.id == trap)
            .map(|t| &t.occupants)
    }

    /// Ticket of the movement request currently in flight for `id`.
    #[must_use]
    pub fn in_flight_move(&self, id: EntityId) -> Option<MoveTicket> {
        self.runtime.get(id)?.motion.map(|m| m.ticket)
    }

    /// Registers a new entity and returns its handle. The seed pose must be
    /// finite; distances against a non-finite position are meaningless and
    /// would leave the newcomer invisible to every range query.
    ///
    /// Entities spawn with a zero interest radius; call
    /// [`Space::set_aoi_radius`] to begin observing. The first step after
    /// spawn evaluates the newcomer against surrounding observers.
    pub fn spawn(
        &mut self,
        descriptor: Arc<EntityDescriptor>,
        seed: EntitySeed,
    ) -> Result<EntityId, EntityError> {
        if !seed.position.is_finite() {
            return Err(EntityError::InvalidArgument("position must be finite"));
        }
        if !seed.direction.is_finite() {
            return Err(EntityError::InvalidArgument("direction must be finite"));
        }
        let top_speed = self.config.default_top_speed;
        let top_speed_y = self.config.default_top_speed_y;
        let id = self.entities.insert_with_key(|key| Entity {
            id: key,
            descriptor,
            position: seed.position,
            direction: seed.direction,
            real: seed.real,
            destroyed: false,
            aoi_radius: 0.0,
            aoi_hysteresis: 0.0,
            witnessed: false,
            has_witness: seed.witness,
            view: HashSet::new(),
            witnessed_by: std::array::from_fn(|_| HashMap::new()),
            top_speed,
            top_speed_y,
            base_handle: None,
            client_handle: None,
        });
        self.runtime.insert(
            id,
            EntityRuntime {
                dirty: true,
                ..EntityRuntime::default()
            },
        );
        Ok(id)
    }

    /// Tears an entity down: halts movement, severs every witness edge in
    /// both directions, clears traps, and schedules the slot for reclaim at
    /// the end of the next step.
    ///
    /// Returns `false` when the entity is unknown or already destroyed.
    /// Callbacks for affected peers fire immediately; the handle keeps
    /// resolving (with [`Entity::is_destroyed`] set) until reclaim.
    pub fn destroy(&mut self, id: EntityId) -> bool {
        let Some(entity) = self.entities.get(id) else {
            return false;
        };
        if entity.destroyed {
            return false;
        }
        debug!(
            entity = ?id,
            watching = entity.view.len(),
            watched_by = entity.witness_count(),
            "destroying entity"
        );

        if let Some(rt) = self.runtime.get_mut(id) {
            if rt.motion.take().is_some() {
                self.movement.cancel(id);
            }
            rt.traps.clear();
            rt.dirty = false;
        }

        let mut scratch = TickReport::default();
        let watched: Vec<EntityId> = self
            .entities
            .get(id)
            .map(|e| e.view.iter().copied().collect())
            .unwrap_or_default();
        for target in watched {
            self.apply_leave(id, target, true, &mut scratch);
        }

        let observers: Vec<EntityId> = self
            .entities
            .get(id)
            .map(|e| e.witnesses().collect())
            .unwrap_or_default();
        for observer in observers {
            if let Some(peer) = self.entities.get_mut(observer) {
                peer.view.remove(&id);
            }
            self.outbox.push(WitnessEvent::ViewLeave {
                observer,
                entity: id,
            });
            self.outbox.push(WitnessEvent::WitnessRemoved {
                entity: id,
                observer,
            });
        }

        if let Some(entity) = self.entities.get_mut(id) {
            for partition in &mut entity.witnessed_by {
                partition.clear();
            }
            entity.view.clear();
            let was_witnessed = entity.witnessed;
            entity.witnessed = false;
            entity.destroyed = true;
            if was_witnessed {
                self.outbox.push(WitnessEvent::WitnessedLost { entity: id });
            }
        }
        self.outbox.push(WitnessEvent::Destroyed { entity: id });
        self.pending_reclaim.push(id);
        self.flush_events();
        true
    }

    /// Teleports the authoritative instance and marks it for re-evaluation.
    pub fn set_position(&mut self, id: EntityId, position: Position) -> Result<(), EntityError> {
        if !position.is_finite() {
            return Err(EntityError::InvalidArgument("position must be finite"));
        }
        let entity = self.entities.get_mut(id).ok_or(EntityError::NotFound)?;
        if entity.destroyed {
            return Ok(());
        }
        if !entity.real {
            return Err(EntityError::NotReal);
        }
        entity.position = position;
        self.mark_dirty(id);
        Ok(())
    }

    /// Updates facing only. Direction never affects interest, so this does
    /// not mark the entity dirty.
    pub fn set_direction(&mut self, id: EntityId, direction: Direction) -> Result<(), EntityError> {
        if !direction.is_finite() {
            return Err(EntityError::InvalidArgument("direction must be finite"));
        }
        let entity = self.entities.get_mut(id).ok_or(EntityError::NotFound)?;
        if entity.destroyed {
            return Ok(());
        }
        if !entity.real {
            return Err(EntityError::NotReal);
        }
        entity.direction = direction;
        Ok(())
    }

    /// Teleports and reorients in one call. Both arguments are validated
    /// before either field is written, so a rejected call mutates nothing.
    pub fn set_position_and_direction(
        &mut self,
        id: EntityId,
        position: Position,
        direction: Direction,
    ) -> Result<(), EntityError> {
        if !position.is_finite() {
            return Err(EntityError::InvalidArgument("position must be finite"));
        }
        if !direction.is_finite() {
            return Err(EntityError::InvalidArgument("direction must be finite"));
        }
        self.set_position(id, position)?;
        self.set_direction(id, direction)
    }

    /// Resizes the interest volume.
    ///
    /// Shrinking takes effect at the next step as observed entities fall
    /// outside the new reach. The returned [`AoiResize`] compares total
    /// reach before and after so callers can trigger an immediate rescan on
    /// growth via [`Space::reevaluate`].
    pub fn set_aoi_radius(
        &mut self,
        id: EntityId,
        radius: f32,
        hysteresis: f32,
    ) -> Result<AoiResize, EntityError> {
        if !radius.is_finite() || radius < 0.0 {
            return Err(EntityError::InvalidArgument("radius must be non-negative"));
        }
        if !hysteresis.is_finite() || hysteresis < 0.0 {
            return Err(EntityError::InvalidArgument(
                "hysteresis must be non-negative",
            ));
        }
        let entity = self.entities.get_mut(id).ok_or(EntityError::NotFound)?;
        if entity.destroyed {
            return Ok(AoiResize::Unchanged);
        }
        let before = entity.reach();
        entity.aoi_radius = radius;
        entity.aoi_hysteresis = hysteresis;
        let after = entity.reach();
        self.mark_dirty(id);
        Ok(if after > before {
            AoiResize::Grew
        } else if after < before {
            AoiResize::Shrank
        } else {
            AoiResize::Unchanged
        })
    }

    /// Grants observer capability. Returns `true` if the flag flipped.
    pub fn grant_witness(&mut self, id: EntityId) -> Result<bool, EntityError> {
        let entity = self.entities.get_mut(id).ok_or(EntityError::NotFound)?;
        if entity.destroyed || entity.has_witness {
            return Ok(false);
        }
        entity.has_witness = true;
        self.mark_dirty(id);
        self.outbox.push(WitnessEvent::WitnessGranted { entity: id });
        self.flush_events();
        Ok(true)
    }

    /// Revokes observer capability, immediately severing every view edge
    /// this entity holds. Returns `true` if the flag flipped.
    pub fn revoke_witness(&mut self, id: EntityId) -> Result<bool, EntityError> {
        let entity = self.entities.get(id).ok_or(EntityError::NotFound)?;
        if entity.destroyed || !entity.has_witness {
            return Ok(false);
        }
        let watched: Vec<EntityId> = entity.view.iter().copied().collect();
        let mut scratch = TickReport::default();
        for target in watched {
            self.apply_leave(id, target, true, &mut scratch);
        }
        if let Some(entity) = self.entities.get_mut(id) {
            entity.has_witness = false;
        }
        self.outbox.push(WitnessEvent::WitnessRevoked { entity: id });
        self.flush_events();
        Ok(true)
    }

    /// Sets the linear top speed; zero disables the cap.
    pub fn set_top_speed(&mut self, id: EntityId, speed: f32) -> Result<(), EntityError> {
        if !speed.is_finite() || speed < 0.0 {
            return Err(EntityError::InvalidArgument("top speed must be non-negative"));
        }
        let entity = self.entities.get_mut(id).ok_or(EntityError::NotFound)?;
        if entity.destroyed {
            return Ok(());
        }
        entity.top_speed = speed;
        Ok(())
    }

    /// Sets the vertical top speed; zero disables the cap.
    pub fn set_top_speed_y(&mut self, id: EntityId, speed: f32) -> Result<(), EntityError> {
        if !speed.is_finite() || speed < 0.0 {
            return Err(EntityError::InvalidArgument("top speed must be non-negative"));
        }
        let entity = self.entities.get_mut(id).ok_or(EntityError::NotFound)?;
        if entity.destroyed {
            return Ok(());
        }
        entity.top_speed_y = speed;
        Ok(())
    }

    /// Attaches or detaches the entity's base-process routing handle.
    pub fn set_base_handle(
        &mut self,
        id: EntityId,
        handle: Option<RemoteHandle>,
    ) -> Result<(), EntityError> {
        let entity = self.entities.get_mut(id).ok_or(EntityError::NotFound)?;
        if entity.destroyed {
            return Ok(());
        }
        entity.base_handle = handle;
        Ok(())
    }

    /// Attaches or detaches the entity's client routing handle. Own-client
    /// property delivery keys off its presence.
    pub fn set_client_handle(
        &mut self,
        id: EntityId,
        handle: Option<RemoteHandle>,
    ) -> Result<(), EntityError> {
        let entity = self.entities.get_mut(id).ok_or(EntityError::NotFound)?;
        if entity.destroyed {
            return Ok(());
        }
        entity.client_handle = handle;
        Ok(())
    }

    /// Routes a property change to its audience.
    ///
    /// Observers at tiers at or tighter than the property's detail level
    /// receive it live (provided they have a client attached). Observers at
    /// looser logged tiers have the key appended to their pending log if
    /// that level was delivered to them before. Extreme observers get
    /// nothing; their resync on return is always full. Replicas and
    /// destroyed entities broadcast nothing.
    pub fn property_changed(&mut self, id: EntityId, key: PropertyKey) -> Result<(), EntityError> {
        let entity = self.entities.get(id).ok_or(EntityError::NotFound)?;
        if entity.destroyed || !entity.real {
            return Ok(());
        }
        let Some(property) = entity.descriptor.property(key) else {
            return Err(EntityError::InvalidArgument("unknown property key"));
        };
        let scope = property.scope;
        let lod = property.lod;
        let own_client = scope.includes_own_client() && entity.client_handle.is_some();

        let mut live_audience: Vec<EntityId> = Vec::new();
        let mut backlog: Vec<EntityId> = Vec::new();
        if scope.broadcasts() && entity.witnessed {
            for tier in Tier::ALL {
                if tier.index() <= lod.index() {
                    live_audience.extend(entity.witnesses_at(tier));
                } else if tier.is_logged() {
                    backlog.extend(entity.witnesses_at(tier));
                }
            }
        }
        live_audience.retain(|&observer| {
            self.entities
                .get(observer)
                .is_some_and(|peer| peer.client_handle.is_some())
        });
        if !backlog.is_empty()
            && let Some(target) = self.entities.get_mut(id)
        {
            for observer in backlog {
                if let Some(record) = target.witness_record_mut(observer) {
                    record.log_change(lod, key);
                }
            }
        }
        if own_client || !live_audience.is_empty() {
            self.outbox.push(WitnessEvent::PropertyChanged {
                entity: id,
                property: key,
                own_client,
                observers: live_audience,
            });
            self.flush_events();
        }
        Ok(())
    }

    /// Registers a radius trap on `id`. Occupancy is diffed every step and
    /// crossings surface as trap events. Only the authoritative instance
    /// may register traps.
    pub fn add_proximity(&mut self, id: EntityId, radius: f32) -> Result<TrapId, EntityError> {
        if !radius.is_finite() || radius <= 0.0 {
            return Err(EntityError::InvalidArgument("trap radius must be positive"));
        }
        let entity = self.entities.get(id).ok_or(EntityError::NotFound)?;
        if entity.destroyed {
            return Err(EntityError::AlreadyDestroyed);
        }
        if !entity.real {
            return Err(EntityError::NotReal);
        }
        let rt = self.runtime.get_mut(id).ok_or(EntityError::NotFound)?;
        rt.next_trap = rt.next_trap.wrapping_add(1);
        let trap = TrapId(rt.next_trap);
        rt.traps.push(ProximityTrap {
            id: trap,
            radius,
            occupants: HashSet::new(),
        });
        Ok(trap)
    }

    /// Removes a trap. Returns `false` when the trap id is unknown;
    /// occupants receive no exit events.
    pub fn del_proximity(&mut self, id: EntityId, trap: TrapId) -> Result<bool, EntityError> {
        if !self.entities.contains_key(id) {
            return Err(EntityError::NotFound);
        }
        let rt = self.runtime.get_mut(id).ok_or(EntityError::NotFound)?;
        let before = rt.traps.len();
        rt.traps.retain(|t| t.id != trap);
        Ok(rt.traps.len() != before)
    }

    /// Ad-hoc range query against live registry state, excluding `id`
    /// itself and destroyed entities. Distance is inclusive of `radius`.
    pub fn entities_in_range(&self, id: EntityId, radius: f32) -> Result<Vec<EntityId>, EntityError> {
        if !radius.is_finite() || radius < 0.0 {
            return Err(EntityError::InvalidArgument("radius must be non-negative"));
        }
        let entity = self.entities.get(id).ok_or(EntityError::NotFound)?;
        if entity.destroyed {
            return Ok(Vec::new());
        }
        let origin = entity.position;
        Ok(self
            .entities
            .iter()
            .filter(|&(other, peer)| {
                other != id && !peer.destroyed && origin.distance(peer.position) <= radius
            })
            .map(|(other, _)| other)
            .collect())
    }

    /// Requests straight-line movement to `destination`. Any request already
    /// in flight is superseded. Returns the ticket completions must quote.
    pub fn move_to_point(
        &mut self,
        id: EntityId,
        destination: Position,
        velocity: f32,
        context: u64,
        face_movement: bool,
        move_vertically: bool,
    ) -> Result<MoveTicket, EntityError> {
        let command = MoveCommand::Point {
            destination,
            face_movement,
            move_vertically,
        };
        self.begin_move(id, command, velocity, context)
    }

    /// Requests one navigation step toward `destination`, bounded by the
    /// per-step and total distance limits. Supersedes like
    /// [`Space::move_to_point`].
    #[allow(clippy::too_many_arguments)]
    pub fn navigate_step(
        &mut self,
        id: EntityId,
        destination: Position,
        velocity: f32,
        max_move_distance: f32,
        max_distance: f32,
        face_movement: bool,
        girth: f32,
        context: u64,
    ) -> Result<MoveTicket, EntityError> {
        if !max_move_distance.is_finite() || max_move_distance < 0.0 {
            return Err(EntityError::InvalidArgument(
                "max_move_distance must be non-negative",
            ));
        }
        if !max_distance.is_finite() || max_distance < 0.0 {
            return Err(EntityError::InvalidArgument(
                "max_distance must be non-negative",
            ));
        }
        if !girth.is_finite() || girth < 0.0 {
            return Err(EntityError::InvalidArgument("girth must be non-negative"));
        }
        let command = MoveCommand::NavigateStep {
            destination,
            max_move_distance,
            max_distance,
            face_movement,
            girth,
        };
        self.begin_move(id, command, velocity, context)
    }

    fn begin_move(
        &mut self,
        id: EntityId,
        command: MoveCommand,
        velocity: f32,
        context: u64,
    ) -> Result<MoveTicket, EntityError> {
        let destination = match command {
            MoveCommand::Point { destination, .. }
            | MoveCommand::NavigateStep { destination, .. } => destination,
        };
        if !destination.is_finite() {
            return Err(EntityError::InvalidArgument("destination must be finite"));
        }
        if !velocity.is_finite() || velocity <= 0.0 {
            return Err(EntityError::InvalidArgument("velocity must be positive"));
        }
        let entity = self.entities.get(id).ok_or(EntityError::NotFound)?;
        if entity.destroyed {
            return Err(EntityError::AlreadyDestroyed);
        }
        if !entity.real {
            return Err(EntityError::NotReal);
        }
        let mut clamped = velocity;
        if entity.top_speed > 0.0 {
            clamped = clamped.min(entity.top_speed);
        }
        if command.moves_vertically() && entity.top_speed_y > 0.0 {
            clamped = clamped.min(entity.top_speed_y);
        }
        let rt = self.runtime.get_mut(id).ok_or(EntityError::NotFound)?;
        if rt.motion.is_some() {
            self.movement.cancel(id);
        }
        rt.move_seq = rt.move_seq.wrapping_add(1);
        let ticket = MoveTicket(rt.move_seq);
        rt.motion = Some(ActiveMove { ticket, context });
        let request = MoveRequest {
            command,
            velocity: clamped,
            context,
            ticket,
        };
        self.movement.begin(id, &request);
        Ok(ticket)
    }

    /// Cancels the in-flight movement request, if any. Safe to call at any
    /// time; returns whether a request was actually cancelled.
    pub fn stop_move(&mut self, id: EntityId) -> Result<bool, EntityError> {
        let entity = self.entities.get(id).ok_or(EntityError::NotFound)?;
        if entity.destroyed {
            return Ok(false);
        }
        let rt = self.runtime.get_mut(id).ok_or(EntityError::NotFound)?;
        let had = rt.motion.take().is_some();
        if had {
            self.movement.cancel(id);
        }
        Ok(had)
    }

    /// Reports that the executor finished the request identified by
    /// `ticket`. A stale ticket (superseded or cancelled request) is
    /// ignored and returns `false`; a match emits
    /// [`WitnessEvent::MoveCompleted`] with the original context.
    pub fn complete_move(&mut self, id: EntityId, ticket: MoveTicket) -> Result<bool, EntityError> {
        let entity = self.entities.get(id).ok_or(EntityError::NotFound)?;
        if entity.destroyed {
            return Ok(false);
        }
        let rt = self.runtime.get_mut(id).ok_or(EntityError::NotFound)?;
        match rt.motion {
            Some(active) if active.ticket == ticket => {
                rt.motion = None;
                self.outbox.push(WitnessEvent::MoveCompleted {
                    entity: id,
                    context: active.context,
                });
                self.flush_events();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Re-evaluates one entity's interest relationships immediately instead
    /// of waiting for the next step. Returns `false` for destroyed entities.
    pub fn reevaluate(&mut self, id: EntityId) -> Result<bool, EntityError> {
        let entity = self.entities.get(id).ok_or(EntityError::NotFound)?;
        if entity.destroyed {
            return Ok(false);
        }
        let frame = self.stage_rebuild_index();
        if frame.handles.is_empty() {
            return Ok(false);
        }
        let transitions = Self::classify_entity(&self.entities, self.index.as_ref(), &frame, id);
        if let Some(rt) = self.runtime.get_mut(id) {
            rt.dirty = false;
        }
        let mut scratch = TickReport::default();
        for transition in transitions {
            self.apply_transition(transition, &mut scratch);
        }
        self.flush_events();
        Ok(true)
    }

    /// Advances the simulation one step.
    ///
    /// Stages run in a fixed order: rebuild the spatial index from live
    /// positions, classify dirty entities in parallel, apply the proposed
    /// transitions serially, diff trap occupancy, reclaim destroyed slots,
    /// then record a summary and flush events to the sink.
    pub fn step(&mut self) -> TickReport {
        let next_tick = self.tick.next();
        let mut report = TickReport {
            tick: next_tick,
            ..TickReport::default()
        };

        let frame = self.stage_rebuild_index();
        self.stage_interest(&frame, &mut report);
        self.stage_traps(&frame, &mut report);
        self.stage_reclaim(&mut report);
        self.stage_summary(next_tick, &report);

        self.tick = next_tick;
        self.flush_events();
        report
    }

    fn mark_dirty(&mut self, id: EntityId) {
        if let Some(rt) = self.runtime.get_mut(id) {
            rt.dirty = true;
        }
    }

    fn flush_events(&mut self) {
        if self.outbox.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.outbox);
        self.replication.on_events(self.tick, &events);
    }

    /// Rebuilds the spatial index over live entities and captures the
    /// handle table queries resolve against.
    fn stage_rebuild_index(&mut self) -> InterestFrame {
        let mut handles = Vec::with_capacity(self.entities.len());
        let mut positions = Vec::with_capacity(self.entities.len());
        let mut max_reach = 0.0f32;
        for (id, entity) in &self.entities {
            if entity.destroyed {
                continue;
            }
            handles.push(id);
            positions.push(entity.position.as_tuple());
            if entity.has_witness && entity.real {
                max_reach = max_reach.max(entity.reach());
            }
        }
        if let Err(error) = self.index.rebuild(&positions) {
            warn!(%error, "spatial index rebuild failed; deferring interest pass");
            return InterestFrame::empty();
        }
        InterestFrame { handles, max_reach }
    }

    /// Classifies every dirty entity in parallel, then applies the proposed
    /// transitions serially in proposal order.
    fn stage_interest(&mut self, frame: &InterestFrame, report: &mut TickReport) {
        if frame.handles.is_empty() {
            return;
        }
        let dirty: Vec<EntityId> = frame
            .handles
            .iter()
            .copied()
            .filter(|id| self.runtime.get(*id).is_some_and(|rt| rt.dirty))
            .collect();
        if dirty.is_empty() {
            return;
        }
        report.evaluated = dirty.len();

        let entities = &self.entities;
        let index = self.index.as_ref();
        let proposals: Vec<Vec<Transition>> = dirty
            .par_iter()
            .map(|&id| Self::classify_entity(entities, index, frame, id))
            .collect();

        for id in &dirty {
            if let Some(rt) = self.runtime.get_mut(*id) {
                rt.dirty = false;
            }
        }
        for transition in proposals.into_iter().flatten() {
            self.apply_transition(transition, report);
        }
    }

    /// Computes transition proposals for one dirty entity.
    ///
    /// Covers both directions: the entity as observer (reconcile its view
    /// against a range query) and as observed (re-evaluate existing
    /// observers by distance, then discover new ones with a reverse query
    /// at the widest observer reach in the frame).
    fn classify_entity(
        entities: &SlotMap<EntityId, Entity>,
        index: &dyn SpatialQuery,
        frame: &InterestFrame,
        id: EntityId,
    ) -> Vec<Transition> {
        let Some(entity) = entities.get(id) else {
            return Vec::new();
        };
        if entity.destroyed {
            return Vec::new();
        }
        let mut out = Vec::new();
        let origin = entity.position.as_tuple();

        if entity.has_witness && entity.real {
            let mut found: HashSet<EntityId> = HashSet::with_capacity(entity.view.len());
            if entity.aoi_radius > 0.0 {
                index.query_nearby(origin, entity.reach(), &mut |slot, distance: OrderedFloat<f32>| {
                    let candidate = frame.handles[slot];
                    if candidate == id {
                        return;
                    }
                    found.insert(candidate);
                    if entity.view.contains(&candidate) {
                        out.push(Transition::Refresh {
                            observer: id,
                            target: candidate,
                        });
                    } else if distance.into_inner() < entity.aoi_radius {
                        out.push(Transition::Enter {
                            observer: id,
                            target: candidate,
                        });
                    }
                });
            }
            for &target in &entity.view {
                if !found.contains(&target) {
                    out.push(Transition::Leave {
                        observer: id,
                        target,
                    });
                }
            }
        }

        for observer in entity.witnesses() {
            let Some(peer) = entities.get(observer) else {
                out.push(Transition::Refresh {
                    observer,
                    target: id,
                });
                continue;
            };
            let distance = peer.position.distance(entity.position);
            if distance > peer.reach() {
                out.push(Transition::Leave {
                    observer,
                    target: id,
                });
            } else {
                out.push(Transition::Refresh {
                    observer,
                    target: id,
                });
            }
        }

        if frame.max_reach > 0.0 {
            index.query_nearby(origin, frame.max_reach, &mut |slot, _distance: OrderedFloat<f32>| {
                let candidate = frame.handles[slot];
                if candidate == id {
                    return;
                }
                let Some(peer) = entities.get(candidate) else {
                    return;
                };
                if peer.has_witness
                    && peer.real
                    && !peer.destroyed
                    && !peer.view.contains(&id)
                    && peer.position.distance(entity.position) < peer.aoi_radius
                {
                    out.push(Transition::Enter {
                        observer: candidate,
                        target: id,
                    });
                }
            });
        }

        out
    }

    fn apply_transition(&mut self, transition: Transition, report: &mut TickReport) {
        match transition {
            Transition::Enter { observer, target } => self.apply_enter(observer, target, report),
            Transition::Refresh { observer, target } => {
                self.apply_refresh(observer, target, report);
            }
            Transition::Leave { observer, target } => {
                self.apply_leave(observer, target, false, report);
            }
        }
    }

    /// Commits an enter after re-validating it against live state. Both
    /// sides mutate together: the observer's view gains the target and the
    /// target's partition for the entry tier gains a fresh record.
    fn apply_enter(&mut self, observer: EntityId, target: EntityId, report: &mut TickReport) {
        let Some(obs) = self.entities.get(observer) else {
            return;
        };
        let Some(tgt) = self.entities.get(target) else {
            return;
        };
        if obs.destroyed || tgt.destroyed || !obs.has_witness || !obs.real {
            return;
        }
        if obs.view.contains(&target) {
            return;
        }
        let distance = obs.position.distance(tgt.position);
        if distance >= obs.aoi_radius {
            return;
        }
        let tier = tgt.descriptor.tiers().classify_entry(distance);

        if let Some(obs) = self.entities.get_mut(observer) {
            obs.view.insert(target);
        }
        let mut first_witness = false;
        if let Some(tgt) = self.entities.get_mut(target) {
            first_witness = !tgt.witnessed;
            tgt.insert_witness(observer, WitnessRecord::new(tier, distance));
            tgt.witnessed = true;
        }
        report.enters += 1;
        self.outbox.push(WitnessEvent::ViewEnter {
            observer,
            entity: target,
            tier,
            range: distance,
        });
        self.outbox.push(WitnessEvent::WitnessAdded {
            entity: target,
            observer,
            tier,
            range: distance,
        });
        if first_witness {
            self.outbox
                .push(WitnessEvent::WitnessedAcquired { entity: target });
        }
    }

    /// Re-evaluates an existing edge: refreshes the recorded range, walks
    /// the tier lattice with hysteresis, and emits a tier change with its
    /// per-level resync work when a boundary is crossed.
    fn apply_refresh(&mut self, observer: EntityId, target: EntityId, report: &mut TickReport) {
        let Some(obs) = self.entities.get(observer) else {
            self.heal_dead_observer(observer, target);
            return;
        };
        if obs.destroyed || !obs.view.contains(&target) {
            return;
        }
        let Some(tgt) = self.entities.get(target) else {
            self.heal_dead_view_entry(observer, target);
            return;
        };
        if tgt.destroyed {
            self.heal_dead_view_entry(observer, target);
            return;
        }
        let distance = obs.position.distance(tgt.position);
        if distance > obs.reach() {
            self.apply_leave(observer, target, false, report);
            return;
        }
        let profile = *tgt.descriptor.tiers();
        let Some(record) = tgt.witness_record(observer) else {
            warn!(?observer, ?target, "view edge without witness record");
            return;
        };
        let old = record.tier();
        let new = profile.reclassify(old, distance);
        if new == old {
            if let Some(record) = self
                .entities
                .get_mut(target)
                .and_then(|t| t.witness_record_mut(observer))
            {
                record.set_range(distance);
            }
            return;
        }
        let mut resync = SmallVec::new();
        if let Some(tgt) = self.entities.get_mut(target)
            && let Some(mut record) = tgt.remove_witness(observer)
        {
            resync = record.retier(new);
            record.set_range(distance);
            tgt.insert_witness(observer, record);
        }
        report.tier_changes += 1;
        self.outbox.push(WitnessEvent::TierChange {
            observer,
            entity: target,
            from: old,
            to: new,
            resync,
        });
    }

    /// Commits a leave. Engine-proposed leaves (`forced == false`) are
    /// re-validated against live distance; a pair still within reach means
    /// the index under-reported, so the edge is kept and the observer is
    /// re-marked dirty to retry next step. Forced leaves come from destroy
    /// and revoke paths and skip the distance check.
    fn apply_leave(
        &mut self,
        observer: EntityId,
        target: EntityId,
        forced: bool,
        report: &mut TickReport,
    ) {
        let Some(obs) = self.entities.get(observer) else {
            self.heal_dead_observer(observer, target);
            return;
        };
        if !obs.view.contains(&target) {
            return;
        }
        if !forced
            && let Some(tgt) = self.entities.get(target)
            && !tgt.destroyed
            && obs.position.distance(tgt.position) <= obs.reach()
        {
            self.mark_dirty(observer);
            return;
        }

        if let Some(obs) = self.entities.get_mut(observer) {
            obs.view.remove(&target);
        }
        let mut removed = false;
        let mut lost = false;
        if let Some(tgt) = self.entities.get_mut(target) {
            removed = tgt.remove_witness(observer).is_some();
            if removed && tgt.witnessed && !tgt.any_witness() {
                tgt.witnessed = false;
                lost = true;
            }
        }
        report.leaves += 1;
        self.outbox.push(WitnessEvent::ViewLeave {
            observer,
            entity: target,
        });
        if removed {
            self.outbox.push(WitnessEvent::WitnessRemoved {
                entity: target,
                observer,
            });
        }
        if lost {
            self.outbox.push(WitnessEvent::WitnessedLost { entity: target });
        }
    }

    /// Drops the witness record a vanished observer left behind on
    /// `target`. The peers of a destroyed entity are notified during
    /// destroy, so this fires only if an edge outlived its slot.
    fn heal_dead_observer(&mut self, observer: EntityId, target: EntityId) {
        warn!(?observer, ?target, "healing witness record for vanished observer");
        let mut lost = false;
        if let Some(tgt) = self.entities.get_mut(target) {
            let removed = tgt.remove_witness(observer).is_some();
            if removed && tgt.witnessed && !tgt.any_witness() {
                tgt.witnessed = false;
                lost = true;
            }
        }
        if lost {
            self.outbox.push(WitnessEvent::WitnessedLost { entity: target });
        }
    }

    /// Drops a view entry whose target no longer resolves or is destroyed.
    fn heal_dead_view_entry(&mut self, observer: EntityId, target: EntityId) {
        warn!(?observer, ?target, "healing view entry for vanished target");
        if let Some(obs) = self.entities.get_mut(observer) {
            obs.view.remove(&target);
        }
    }

    /// Diffs every trap's occupancy against a fresh range query. Occupants
    /// that stopped resolving (or died) exit by id only.
    fn stage_traps(&mut self, frame: &InterestFrame, report: &mut TickReport) {
        if frame.handles.is_empty() {
            return;
        }
        let owners: Vec<EntityId> = self
            .runtime
            .iter()
            .filter(|(_, rt)| !rt.traps.is_empty())
            .map(|(id, _)| id)
            .collect();
        for owner in owners {
            let origin = match self.entities.get(owner) {
                Some(entity) if !entity.destroyed && entity.real => entity.position,
                _ => continue,
            };
            let specs: Vec<(TrapId, f32)> = self
                .runtime
                .get(owner)
                .map(|rt| rt.traps.iter().map(|t| (t.id, t.radius)).collect())
                .unwrap_or_default();
            for (trap, radius) in specs {
                let mut now: HashSet<EntityId> = HashSet::new();
                self.index
                    .query_nearby(origin.as_tuple(), radius, &mut |slot, _distance: OrderedFloat<f32>| {
                        let candidate = frame.handles[slot];
                        if candidate != owner {
                            now.insert(candidate);
                        }
                    });
                let Some(previous) = self.runtime.get_mut(owner).and_then(|rt| {
                    rt.traps
                        .iter_mut()
                        .find(|t| t.id == trap)
                        .map(|t| std::mem::replace(&mut t.occupants, now.clone()))
                }) else {
                    continue;
                };
                for &arrival in now.difference(&previous) {
                    let range = self
                        .entities
                        .get(arrival)
                        .map_or(0.0, |e| e.position.distance(origin));
                    report.trap_enters += 1;
                    self.outbox.push(WitnessEvent::TrapEnter {
                        owner,
                        trap,
                        entity: arrival,
                        range,
                    });
                }
                for &departed in previous.difference(&now) {
                    report.trap_leaves += 1;
                    match self.entities.get(departed) {
                        Some(peer) if !peer.destroyed => {
                            self.outbox.push(WitnessEvent::TrapLeave {
                                owner,
                                trap,
                                entity: departed,
                                range: peer.position.distance(origin),
                            });
                        }
                        _ => {
                            self.outbox.push(WitnessEvent::TrapLeaveById {
                                owner,
                                trap,
                                entity: departed,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Releases slots destroyed before this step. Handles stop resolving
    /// here; generational keys make any survivor references detectable.
    fn stage_reclaim(&mut self, report: &mut TickReport) {
        if self.pending_reclaim.is_empty() {
            return;
        }
        let dead: Vec<EntityId> = self.pending_reclaim.drain(..).collect();
        for id in dead {
            if self.entities.remove(id).is_some() {
                report.reclaimed += 1;
            }
            self.runtime.remove(id);
        }
    }

    fn stage_summary(&mut self, tick: Tick, report: &TickReport) {
        let mut entity_count = 0;
        let mut observer_count = 0;
        let mut witnessed_count = 0;
        let mut edge_count = 0;
        for entity in self.entities.values() {
            if entity.destroyed {
                continue;
            }
            entity_count += 1;
            if entity.has_witness && entity.real {
                observer_count += 1;
            }
            if entity.witnessed {
                witnessed_count += 1;
            }
            edge_count += entity.view.len();
        }
        let summary = TickSummary {
            tick,
            entity_count,
            observer_count,
            witnessed_count,
            edge_count,
            enters: report.enters,
            leaves: report.leaves,
            tier_changes: report.tier_changes,
        };
        if self.history.len() == self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }
}
