//! End-to-end behavior checks driving [`Space`] through its public API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sightline_core::{
    EntityDescriptor, EntityId, EntitySeed, LOGGED_TIERS, Position, PropertyDef, PropertyScope,
    ReplicationSink, Space, SpaceConfig, Tick, Tier, TierBand, TierProfile, WitnessEvent,
};

#[derive(Default)]
struct LedgerSink {
    events: Arc<Mutex<Vec<WitnessEvent>>>,
}

impl ReplicationSink for LedgerSink {
    fn on_events(&mut self, _tick: Tick, events: &[WitnessEvent]) {
        self.events.lock().expect("ledger").extend_from_slice(events);
    }
}

fn walk_profile() -> TierProfile {
    TierProfile {
        bands: [
            TierBand::new(8.0, 1.5),
            TierBand::new(18.0, 2.0),
            TierBand::new(36.0, 3.0),
        ],
    }
}

fn walk_descriptor() -> Arc<EntityDescriptor> {
    Arc::new(
        EntityDescriptor::new(
            "walker",
            walk_profile(),
            vec![
                PropertyDef::new(1, "pose", PropertyScope::OtherClients, Tier::Near),
                PropertyDef::new(2, "score", PropertyScope::AllClients, Tier::Far),
            ],
        )
        .expect("descriptor"),
    )
}

fn walk_space() -> Space {
    Space::new(SpaceConfig {
        index_cell_size: 16.0,
        ..SpaceConfig::default()
    })
    .expect("space")
}

/// Seeds a mixed population: even slots observe, odd slots are plain targets.
fn seed_population(space: &mut Space, rng: &mut SmallRng, count: usize) -> Vec<EntityId> {
    let mut ids = Vec::with_capacity(count);
    for slot in 0..count {
        let position = Position::new(
            rng.random_range(-40.0..40.0),
            0.0,
            rng.random_range(-40.0..40.0),
        );
        let id = space
            .spawn(
                walk_descriptor(),
                EntitySeed {
                    witness: slot.is_multiple_of(2),
                    ..EntitySeed::at(position)
                },
            )
            .expect("spawn");
        if slot.is_multiple_of(2) {
            space.set_aoi_radius(id, 22.0, 3.0).expect("aoi");
        }
        ids.push(id);
    }
    ids
}

fn wander(space: &mut Space, rng: &mut SmallRng, ids: &[EntityId]) {
    for &id in ids {
        if !space.contains(id) {
            continue;
        }
        let current = space.entity(id).expect("entity").position();
        let next = Position::new(
            (current.x + rng.random_range(-4.0..4.0)).clamp(-45.0, 45.0),
            0.0,
            (current.z + rng.random_range(-4.0..4.0)).clamp(-45.0, 45.0),
        );
        space.set_position(id, next).expect("walk");
    }
}

/// Sweeps the whole graph through the read API and checks the structural
/// invariants that must hold after any step in which every entity moved.
fn assert_graph_consistent(space: &Space) {
    for (id, entity) in space.entities() {
        for &target in entity.view() {
            let peer = space.entity(target).expect("view members resolve");
            assert!(!peer.is_destroyed(), "views never hold destroyed entities");
            assert!(peer.is_witnessed());
            let record = peer
                .witness_record(id)
                .expect("every view edge has a mirror witness record");
            let distance = entity.position().distance(peer.position());
            assert!(
                distance <= entity.reach() + 1e-3,
                "edge beyond reach survived: distance {distance}, reach {}",
                entity.reach()
            );
            let bands = peer.descriptor().tiers().bands;
            let tier = record.tier();
            if tier.index() < LOGGED_TIERS {
                let band = bands[tier.index()];
                assert!(
                    distance <= band.radius + band.hysteresis + 1e-3,
                    "tier {tier:?} held past its exit threshold at distance {distance}"
                );
            }
            if tier.index() > 0 {
                let tighter = bands[tier.index() - 1];
                assert!(
                    distance >= tighter.radius - 1e-3,
                    "tier {tier:?} failed to tighten at distance {distance}"
                );
            }
        }

        let witnesses: Vec<EntityId> = entity.witnesses().collect();
        assert_eq!(
            !witnesses.is_empty(),
            entity.is_witnessed(),
            "witnessed flag mirrors partition occupancy"
        );
        for observer in witnesses {
            let peer = space.entity(observer).expect("witness entries resolve");
            assert!(
                peer.view().contains(&id),
                "witness partitions mirror observer views"
            );
        }
    }

    // Everything was dirty this step, so discovery must be complete: any
    // pair strictly inside an observer's radius has to be linked.
    for (id, entity) in space.entities() {
        if !entity.has_witness() || !entity.is_real() {
            continue;
        }
        for (other, peer) in space.entities() {
            if other == id || peer.is_destroyed() {
                continue;
            }
            let distance = entity.position().distance(peer.position());
            if distance < entity.aoi_radius() {
                assert!(
                    entity.view().contains(&other),
                    "unlinked pair at distance {distance} inside radius {}",
                    entity.aoi_radius()
                );
            }
        }
    }
}

#[test]
fn random_walk_preserves_graph_invariants() {
    let mut space = walk_space();
    let mut rng = SmallRng::seed_from_u64(0xBAD_C0FFE);
    let ids = seed_population(&mut space, &mut rng, 14);

    for _ in 0..60 {
        wander(&mut space, &mut rng, &ids);
        space.step();
        assert_graph_consistent(&space);
    }
}

#[test]
fn destruction_mid_walk_leaves_no_dangling_references() {
    let mut space = walk_space();
    let mut rng = SmallRng::seed_from_u64(7);
    let ids = seed_population(&mut space, &mut rng, 12);
    let mut graveyard: Vec<EntityId> = Vec::new();

    for round in 0..30 {
        wander(&mut space, &mut rng, &ids);
        space.step();
        assert_graph_consistent(&space);
        for &dead in &graveyard {
            assert!(
                space.entity(dead).is_none(),
                "destroyed handles stop resolving after the following step"
            );
            for (_, entity) in space.entities() {
                assert!(!entity.view().contains(&dead));
                assert!(entity.witness_record(dead).is_none());
            }
        }
        if round == 10 {
            assert!(space.destroy(ids[0]), "observer teardown mid-walk");
            graveyard.push(ids[0]);
        }
        if round == 20 {
            assert!(space.destroy(ids[5]), "target teardown mid-walk");
            graveyard.push(ids[5]);
        }
    }
    assert_eq!(space.entity_count(), 10);
}

#[test]
fn event_stream_reconstructs_the_live_graph() {
    let ledger: Arc<Mutex<Vec<WitnessEvent>>> = Arc::default();
    let mut space = Space::with_replication(
        SpaceConfig {
            index_cell_size: 16.0,
            ..SpaceConfig::default()
        },
        Box::new(LedgerSink {
            events: Arc::clone(&ledger),
        }),
    )
    .expect("space");
    let mut rng = SmallRng::seed_from_u64(99);
    let ids = seed_population(&mut space, &mut rng, 10);

    for round in 0..40 {
        wander(&mut space, &mut rng, &ids);
        space.step();
        if round == 25 {
            space.destroy(ids[3]);
        }
    }

    let mut replayed: HashMap<(EntityId, EntityId), Tier> = HashMap::new();
    for event in ledger.lock().expect("ledger").iter() {
        match event {
            WitnessEvent::ViewEnter {
                observer,
                entity,
                tier,
                ..
            } => {
                let previous = replayed.insert((*observer, *entity), *tier);
                assert!(previous.is_none(), "an enter never duplicates a live edge");
            }
            WitnessEvent::ViewLeave { observer, entity } => {
                assert!(
                    replayed.remove(&(*observer, *entity)).is_some(),
                    "a leave always closes a live edge"
                );
            }
            WitnessEvent::TierChange {
                observer,
                entity,
                from,
                to,
                ..
            } => {
                let slot = replayed
                    .get_mut(&(*observer, *entity))
                    .expect("tier changes only touch live edges");
                assert_eq!(slot, from, "tier transitions chain without gaps");
                *slot = *to;
            }
            _ => {}
        }
    }

    let mut live: HashMap<(EntityId, EntityId), Tier> = HashMap::new();
    for (id, entity) in space.entities() {
        for observer in entity.witnesses() {
            let record = entity.witness_record(observer).expect("record");
            live.insert((observer, id), record.tier());
        }
    }
    assert_eq!(
        replayed, live,
        "replaying the event stream yields exactly the live graph"
    );
}

#[test]
fn tier_partitions_follow_distance_bands() {
    let mut space = Space::new(SpaceConfig {
        index_cell_size: 30.0,
        ..SpaceConfig::default()
    })
    .expect("space");
    let keeper = space
        .spawn(
            walk_descriptor(),
            EntitySeed {
                witness: true,
                ..EntitySeed::at(Position::new(0.0, 0.0, 0.0))
            },
        )
        .expect("spawn");
    space.set_aoi_radius(keeper, 60.0, 5.0).expect("aoi");
    let near = space
        .spawn(walk_descriptor(), EntitySeed::at(Position::new(4.0, 0.0, 0.0)))
        .expect("spawn");
    let mid = space
        .spawn(walk_descriptor(), EntitySeed::at(Position::new(12.0, 0.0, 0.0)))
        .expect("spawn");
    let far = space
        .spawn(walk_descriptor(), EntitySeed::at(Position::new(30.0, 0.0, 0.0)))
        .expect("spawn");
    let fringe = space
        .spawn(walk_descriptor(), EntitySeed::at(Position::new(50.0, 0.0, 0.0)))
        .expect("spawn");
    space.step();

    for (id, expected) in [
        (near, Tier::Near),
        (mid, Tier::Mid),
        (far, Tier::Far),
        (fringe, Tier::Extreme),
    ] {
        let entity = space.entity(id).expect("target");
        let record = entity.witness_record(keeper).expect("record");
        assert_eq!(record.tier(), expected);
        assert!(
            entity.witnesses_at(expected).any(|w| w == keeper),
            "records live in the partition matching their tier"
        );
    }
}

#[test]
fn traps_do_not_require_perception() {
    let mut space = walk_space();
    let watcher = space
        .spawn(
            walk_descriptor(),
            EntitySeed {
                witness: true,
                ..EntitySeed::at(Position::new(0.0, 0.0, 0.0))
            },
        )
        .expect("spawn");
    space.set_aoi_radius(watcher, 5.0, 1.0).expect("aoi");
    let trap = space.add_proximity(watcher, 50.0).expect("trap");
    let drifter = space
        .spawn(walk_descriptor(), EntitySeed::at(Position::new(20.0, 0.0, 0.0)))
        .expect("spawn");
    let ghost = space
        .spawn(
            walk_descriptor(),
            EntitySeed {
                real: false,
                ..EntitySeed::at(Position::new(30.0, 0.0, 0.0))
            },
        )
        .expect("spawn");
    space.step();

    assert!(
        space.entity(watcher).expect("watcher").view().is_empty(),
        "a tight perception radius sees nothing at trap range"
    );
    let occupants = space.trap_occupants(watcher, trap).expect("occupants");
    assert!(
        occupants.contains(&drifter) && occupants.contains(&ghost),
        "traps cover replicas and far entities the perception graph ignores"
    );
}

#[test]
fn spawning_inside_an_aoi_is_noticed_without_observer_motion() {
    let mut space = walk_space();
    let sentinel = space
        .spawn(
            walk_descriptor(),
            EntitySeed {
                witness: true,
                ..EntitySeed::at(Position::new(0.0, 0.0, 0.0))
            },
        )
        .expect("spawn");
    space.set_aoi_radius(sentinel, 25.0, 2.0).expect("aoi");
    space.step();
    space.step();

    let newborn = space
        .spawn(walk_descriptor(), EntitySeed::at(Position::new(10.0, 0.0, 0.0)))
        .expect("spawn");
    let report = space.step();
    assert_eq!(report.evaluated, 1, "only the newcomer is dirty");
    assert!(space.entity(sentinel).expect("sentinel").view().contains(&newborn));
    assert!(space.entity(newborn).expect("newborn").is_witnessed());
}

#[test]
fn enter_commits_both_endpoints_before_the_watched_flag() {
    let ledger: Arc<Mutex<Vec<WitnessEvent>>> = Arc::default();
    let mut space = Space::with_replication(
        SpaceConfig::default(),
        Box::new(LedgerSink {
            events: Arc::clone(&ledger),
        }),
    )
    .expect("space");
    let observer = space
        .spawn(
            walk_descriptor(),
            EntitySeed {
                witness: true,
                ..EntitySeed::at(Position::new(0.0, 0.0, 0.0))
            },
        )
        .expect("spawn");
    space.set_aoi_radius(observer, 15.0, 2.0).expect("aoi");
    space
        .spawn(walk_descriptor(), EntitySeed::at(Position::new(5.0, 0.0, 0.0)))
        .expect("spawn");
    space.step();

    let events = ledger.lock().expect("ledger");
    let enter_at = events
        .iter()
        .position(|e| matches!(e, WitnessEvent::ViewEnter { .. }))
        .expect("enter event");
    let added_at = events
        .iter()
        .position(|e| matches!(e, WitnessEvent::WitnessAdded { .. }))
        .expect("witness added event");
    let acquired_at = events
        .iter()
        .position(|e| matches!(e, WitnessEvent::WitnessedAcquired { .. }))
        .expect("witnessed acquired event");
    assert!(
        enter_at < added_at && added_at < acquired_at,
        "the observer edge, the witness record, and the watched flag commit in order"
    );
}
