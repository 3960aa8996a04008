//! Property-based tests for the core store invariants.
//!
//! Random operation sequences are applied both to a [`World`] and to a plain
//! model of what the world should contain. After every step the world's
//! structures must pass [`World::validate`], and at the end every entity's
//! components, relations and every live query count must agree with the
//! model.

use std::collections::BTreeMap;

use kinship_ecs::prelude::*;
use proptest::prelude::*;

// ---------------------------------------------------------------------------
// Component types used in tests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
struct Mass(i32);

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Frozen;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Likes(u8);

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Entity handles are indices into the list of every identity spawned so far,
/// dead ones included, so stale access is exercised too.
#[derive(Debug, Clone)]
enum EcsOp {
    Spawn,
    Despawn(usize),
    AddMass(usize, i32),
    RemoveMass(usize),
    AddFrozen(usize),
    RemoveFrozen(usize),
    Relate(usize, usize, u8),
    Unrelate(usize, usize),
}

fn ecs_op_strategy() -> impl Strategy<Value = EcsOp> {
    prop_oneof![
        3 => Just(EcsOp::Spawn),
        1 => any::<usize>().prop_map(EcsOp::Despawn),
        3 => (any::<usize>(), any::<i32>()).prop_map(|(h, m)| EcsOp::AddMass(h, m)),
        1 => any::<usize>().prop_map(EcsOp::RemoveMass),
        2 => any::<usize>().prop_map(EcsOp::AddFrozen),
        1 => any::<usize>().prop_map(EcsOp::RemoveFrozen),
        3 => (any::<usize>(), any::<usize>(), any::<u8>())
            .prop_map(|(h, t, v)| EcsOp::Relate(h, t, v)),
        1 => (any::<usize>(), any::<usize>()).prop_map(|(h, t)| EcsOp::Unrelate(h, t)),
    ]
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Slot {
    alive: bool,
    mass: Option<i32>,
    frozen: bool,
    /// Target handle -> relation value.
    likes: BTreeMap<usize, u8>,
}

#[derive(Debug, Default)]
struct Model {
    handles: Vec<Identity>,
    slots: Vec<Slot>,
}

impl Model {
    fn pick(&self, raw: usize) -> Option<usize> {
        (!self.handles.is_empty()).then(|| raw % self.handles.len())
    }

    fn alive(&self, h: usize) -> bool {
        self.slots[h].alive
    }
}

/// Apply `op` to both sides and check the world's verdict against the model.
fn step(world: &mut World, model: &mut Model, op: &EcsOp) -> Result<(), TestCaseError> {
    match *op {
        EcsOp::Spawn => {
            let e = world.spawn();
            prop_assert!(e.is_entity());
            prop_assert!(!model.handles.contains(&e), "identity {} handed out twice", e);
            model.handles.push(e);
            model.slots.push(Slot {
                alive: true,
                ..Slot::default()
            });
        }
        EcsOp::Despawn(raw) => {
            let Some(h) = model.pick(raw) else { return Ok(()) };
            let result = world.despawn(model.handles[h]);
            prop_assert_eq!(result.is_ok(), model.alive(h));
            if model.alive(h) {
                model.slots[h] = Slot::default();
                for slot in &mut model.slots {
                    slot.likes.remove(&h);
                }
            }
        }
        EcsOp::AddMass(raw, m) => {
            let Some(h) = model.pick(raw) else { return Ok(()) };
            let result = world.add(model.handles[h], Mass(m));
            let expected = model.alive(h) && model.slots[h].mass.is_none();
            prop_assert_eq!(result.is_ok(), expected);
            if expected {
                model.slots[h].mass = Some(m);
            }
        }
        EcsOp::RemoveMass(raw) => {
            let Some(h) = model.pick(raw) else { return Ok(()) };
            let result = world.remove::<Mass>(model.handles[h]);
            let expected = model.alive(h) && model.slots[h].mass.is_some();
            prop_assert_eq!(result.is_ok(), expected);
            if expected {
                model.slots[h].mass = None;
            }
        }
        EcsOp::AddFrozen(raw) => {
            let Some(h) = model.pick(raw) else { return Ok(()) };
            let result = world.add_default::<Frozen>(model.handles[h]);
            let expected = model.alive(h) && !model.slots[h].frozen;
            prop_assert_eq!(result.is_ok(), expected);
            if expected {
                model.slots[h].frozen = true;
            }
        }
        EcsOp::RemoveFrozen(raw) => {
            let Some(h) = model.pick(raw) else { return Ok(()) };
            let result = world.remove::<Frozen>(model.handles[h]);
            let expected = model.alive(h) && model.slots[h].frozen;
            prop_assert_eq!(result.is_ok(), expected);
            if expected {
                model.slots[h].frozen = false;
            }
        }
        EcsOp::Relate(raw_h, raw_t, v) => {
            let Some(h) = model.pick(raw_h) else { return Ok(()) };
            let t = raw_t % model.handles.len();
            let result = world.add_relation(model.handles[h], model.handles[t], Likes(v));
            let expected =
                model.alive(h) && model.alive(t) && !model.slots[h].likes.contains_key(&t);
            prop_assert_eq!(result.is_ok(), expected);
            if expected {
                model.slots[h].likes.insert(t, v);
            }
        }
        EcsOp::Unrelate(raw_h, raw_t) => {
            let Some(h) = model.pick(raw_h) else { return Ok(()) };
            let t = raw_t % model.handles.len();
            let result = world.remove_relation::<Likes>(model.handles[h], model.handles[t]);
            let expected = model.alive(h) && model.slots[h].likes.contains_key(&t);
            prop_assert_eq!(result.is_ok(), expected);
            if expected {
                model.slots[h].likes.remove(&t);
            }
        }
    }
    Ok(())
}

fn assert_matches_model(world: &World, model: &Model) -> Result<(), TestCaseError> {
    let live = model.slots.iter().filter(|s| s.alive).count();
    prop_assert_eq!(world.count(), live);

    for (h, slot) in model.slots.iter().enumerate() {
        let e = model.handles[h];
        prop_assert_eq!(world.is_alive(e), slot.alive);
        prop_assert_eq!(world.get::<Mass>(e).ok().copied(), slot.mass.map(Mass));
        prop_assert_eq!(world.has::<Frozen>(e), slot.frozen);
        prop_assert_eq!(
            world.has_relation::<Likes>(e, Identity::ANY),
            !slot.likes.is_empty()
        );
        for (t, &target) in model.handles.iter().enumerate() {
            let expected = slot.likes.get(&t).copied().map(Likes);
            prop_assert_eq!(world.get_relation::<Likes>(e, target).ok().copied(), expected);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Random sequences keep the store consistent and in step with the model,
    /// including the despawn cascade over relation holders.
    #[test]
    fn random_ops_match_model(ops in prop::collection::vec(ecs_op_strategy(), 1..80)) {
        let mut world = World::new();
        let massive = world.query().has::<Mass>().build();
        let thawed = world.query().has::<Mass>().not::<Frozen>().build();
        let fans = world.query().has_relation::<Likes>(Identity::ANY).build();
        let mut model = Model::default();

        for op in &ops {
            step(&mut world, &mut model, op)?;
            prop_assert!(world.validate().is_ok(), "invalid after {:?}: {:?}", op, world.validate());
        }
        assert_matches_model(&world, &model)?;

        let live = || model.slots.iter().filter(|s| s.alive);
        prop_assert_eq!(massive.count(&world), live().filter(|s| s.mass.is_some()).count());
        prop_assert_eq!(
            thawed.count(&world),
            live().filter(|s| s.mass.is_some() && !s.frozen).count()
        );
        prop_assert_eq!(fans.count(&world), live().filter(|s| !s.likes.is_empty()).count());
        prop_assert_eq!(massive.entities(&world).len(), massive.count(&world));
    }

    /// A query built after the fact sees the same count as one that tracked
    /// every change incrementally.
    #[test]
    fn late_query_agrees_with_early_query(ops in prop::collection::vec(ecs_op_strategy(), 1..60)) {
        let mut world = World::new();
        let early = world.query().has::<Mass>().has::<Frozen>().build();
        let mut model = Model::default();
        for op in &ops {
            step(&mut world, &mut model, op)?;
        }
        let late = world.query().has::<Frozen>().has::<Mass>().build();
        prop_assert_eq!(early.count(&world), late.count(&world));
        let mut a = early.entities(&world);
        let mut b = late.entities(&world);
        a.sort();
        b.sort();
        prop_assert_eq!(a, b);
    }

    /// Despawned identities stay dead even after their slots are recycled.
    #[test]
    fn stale_ids_detected_after_despawn_and_recycle(
        spawn_count in 1..20usize,
        despawn_indices in prop::collection::vec(0..20usize, 1..10),
    ) {
        let mut world = World::new();
        let mut entities: Vec<Identity> = Vec::new();
        for i in 0..spawn_count {
            let e = world.spawn();
            world.add(e, Mass(i as i32)).unwrap();
            entities.push(e);
        }

        let mut stale: Vec<Identity> = Vec::new();
        for &idx in &despawn_indices {
            if !entities.is_empty() {
                let e = entities.remove(idx % entities.len());
                world.despawn(e).unwrap();
                stale.push(e);
            }
        }

        for _ in 0..stale.len() {
            let e = world.spawn();
            world.add(e, Mass(-1)).unwrap();
            entities.push(e);
        }

        for &e in &stale {
            prop_assert!(!world.is_alive(e));
            prop_assert!(world.get::<Mass>(e).is_err());
            prop_assert!(!entities.contains(&e));
        }
        for &e in &entities {
            prop_assert!(world.is_alive(e));
            prop_assert!(world.get::<Mass>(e).is_ok());
        }
    }

    /// Migration in both directions keeps the values of unrelated columns.
    #[test]
    fn archetype_migration_preserves_data(
        mass in any::<i32>(),
        like in any::<u8>(),
        do_remove in proptest::bool::ANY,
    ) {
        let mut world = World::new();
        let target = world.spawn();
        let e = world.spawn();
        world.add(e, Mass(mass)).unwrap();
        world.add_relation(e, target, Likes(like)).unwrap();
        world.add_default::<Frozen>(e).unwrap();

        prop_assert_eq!(world.get::<Mass>(e).unwrap(), &Mass(mass));
        prop_assert_eq!(world.get_relation::<Likes>(e, target).unwrap(), &Likes(like));

        if do_remove {
            world.remove::<Mass>(e).unwrap();
            prop_assert!(!world.has::<Mass>(e));
            prop_assert_eq!(world.get_relation::<Likes>(e, target).unwrap(), &Likes(like));
            prop_assert!(world.has::<Frozen>(e));
        }
        prop_assert!(world.validate().is_ok());
    }
}
