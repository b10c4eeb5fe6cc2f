use approx::assert_abs_diff_eq;
use glam::Vec3;
use rust_pbd_evolution::physics::constraints::{LongRangeConstraints, SpringConstraints, XpbdSpringConstraints};
use rust_pbd_evolution::{
    CollisionGeometry, ConstraintId, DispatchMode, Evolution, KinematicParticle, KinematicUpdate, ParticleGroup,
    RigidPose, SolverConfig, ThreadDispatcher,
};
use std::sync::Arc;

fn weightless(evolution: &mut Evolution, group_id: u32) {
    evolution.groups_mut().ensure(group_id);
    evolution.groups_mut().get_mut(group_id).gravity = Vec3::ZERO;
}

/// Adds a chain of `links + 1` particles along X starting at `origin`, with the first particle kinematic.
/// Springs are added anchor first. Returns the first particle.
fn add_hanging_chain(evolution: &mut Evolution, springs: &mut SpringConstraints, origin: Vec3, links: u32) -> u32 {
    let first = evolution.add_particles(links + 1, 0);
    let particles = evolution.particles_mut();
    for i in 0..=links {
        particles.set_position(first + i, origin + Vec3::X * i as f32);
    }
    particles.set_kinematic(first);
    for i in 0..links {
        springs.add_constraint([first + i, first + i + 1], 1.0, 1.0);
    }
    first
}

#[test]
fn stiff_spring_reaches_rest_length_in_one_step() {
    let mut evolution = Evolution::new(SolverConfig::default()).unwrap();
    weightless(&mut evolution, 0);
    let first = evolution.add_particles(2, 0);
    evolution.particles_mut().set_position(first + 1, Vec3::new(2.0, 0.0, 0.0));
    let mut springs = SpringConstraints::new();
    springs.add_constraint([first, first + 1], 1.0, 1.0);
    evolution.add_constraint_rule(springs);

    evolution.advance_one_time_step(1.0 / 60.0);

    let x = evolution.particles().x();
    assert_abs_diff_eq!(x[0].distance(x[1]), 1.0, epsilon = 1e-4);
    // Equal masses move symmetrically.
    assert_abs_diff_eq!(x[0].x + x[1].x, 2.0, epsilon = 1e-4);
}

#[test]
fn xpbd_spring_reports_its_multiplier() {
    let mut evolution = Evolution::new(SolverConfig::default().with_islands(false)).unwrap();
    weightless(&mut evolution, 0);
    evolution.add_particles(2, 0);
    evolution.particles_mut().set_position(1, Vec3::new(1.5, 0.0, 0.0));
    let mut springs = XpbdSpringConstraints::new();
    springs.add_constraint([0, 1], 1.0, 0.0);
    let rule = evolution.add_constraint_rule(springs);

    evolution.advance_one_time_step(0.1);

    let x = evolution.particles().x();
    assert_abs_diff_eq!(x[0].distance(x[1]), 1.0, epsilon = 1e-4);
    let springs = evolution.rule::<XpbdSpringConstraints>(rule).unwrap().container();
    assert!(springs.lambda(0) < 0.0);
    assert!(springs.force(0) > 0.0);
}

#[test]
fn chain_levels_count_links_from_the_anchor() {
    let mut evolution = Evolution::new(SolverConfig::default().with_colors(false)).unwrap();
    weightless(&mut evolution, 0);
    let mut springs = SpringConstraints::new();
    add_hanging_chain(&mut evolution, &mut springs, Vec3::ZERO, 5);
    evolution.add_constraint_rule(springs);

    evolution.advance_one_time_step(1.0 / 60.0);

    let graph = evolution.graph();
    let levels: Vec<u32> = (0..5)
        .map(|constraint_index| {
            graph
                .edge_for(ConstraintId {
                    container_id: 0,
                    constraint_index,
                })
                .map(|edge| edge.level)
                .unwrap_or(u32::MAX)
        })
        .collect();
    assert_eq!(levels, vec![0, 1, 2, 3, 4]);
    assert_eq!(graph.islands().len(), 1);
    assert_eq!(evolution.counters().max_level, 4);
    assert!(evolution.counters().topology_changed);

    // Same constraints, same particles: the graph is left alone.
    let version = graph.topology_version();
    evolution.advance_one_time_step(1.0 / 60.0);
    assert_eq!(evolution.graph().topology_version(), version);
    assert!(!evolution.counters().topology_changed);
}

#[test]
fn free_fall_follows_gravity_and_kinematics_stay_put() {
    let mut evolution = Evolution::new(SolverConfig::default()).unwrap();
    evolution.add_particles(2, 0);
    evolution.particles_mut().set_kinematic(1);
    evolution.particles_mut().set_position(1, Vec3::new(5.0, 0.0, 0.0));

    evolution.advance_one_time_step(0.01);

    let particles = evolution.particles();
    assert_abs_diff_eq!(particles.v()[0].z, -9.80665, epsilon = 1e-4);
    assert_abs_diff_eq!(particles.x()[0].z, -0.0980665, epsilon = 1e-5);
    assert_eq!(particles.x()[1], Vec3::new(5.0, 0.0, 0.0));
    assert_eq!(particles.v()[1], Vec3::ZERO);
    assert_abs_diff_eq!(evolution.time(), 0.01, epsilon = 1e-7);
}

#[test]
fn kinematic_update_drives_anchors_and_tethers_follow() {
    let mut evolution = Evolution::new(SolverConfig::default()).unwrap();
    weightless(&mut evolution, 0);
    evolution.add_particles(2, 0);
    evolution.particles_mut().set_kinematic(0);
    evolution.particles_mut().set_position(1, Vec3::new(1.0, 0.0, 0.0));
    let mut tethers = LongRangeConstraints::new();
    tethers.add_constraint(0, 1, 1.0, 1.0);
    evolution.add_constraint_rule(tethers);
    let update: KinematicUpdate = Box::new(|particle: KinematicParticle<'_>, dt: f32, _time: f32| {
        *particle.p = particle.x - Vec3::X * (2.0 * dt);
    });
    evolution.set_kinematic_update(Some(update));

    evolution.advance_one_time_step(0.5);

    let x = evolution.particles().x();
    assert_abs_diff_eq!(x[0].x, -1.0, epsilon = 1e-6);
    // The tether pulls the free particle back within its maximum length.
    assert!(x[0].distance(x[1]) <= 1.0 + 1e-4);
    assert_abs_diff_eq!(evolution.particles().v()[0].x, -2.0, epsilon = 1e-5);
}

#[test]
fn inactive_ranges_are_frozen() {
    let mut evolution = Evolution::new(SolverConfig::default()).unwrap();
    evolution.add_particles(1, 0);
    let frozen = evolution.add_particles(3, 0);
    assert!(evolution.activate_particle_range(frozen, false));
    assert!(!evolution.activate_particle_range(2, false));

    evolution.advance_one_time_step(0.01);

    let x = evolution.particles().x();
    assert!(x[0].z < 0.0);
    assert!(x[1..].iter().all(|&position| position == Vec3::ZERO));
}

#[test]
fn particles_come_to_rest_on_a_ground_plane() {
    let mut evolution = Evolution::new(SolverConfig::default()).unwrap();
    evolution.add_particles(1, 0);
    evolution.groups_mut().get_mut(0).collision_thickness = 0.1;
    evolution.particles_mut().set_position(0, Vec3::new(0.0, 0.0, 1.0));
    evolution.add_collision_particle(CollisionGeometry::Plane, RigidPose::default(), 0);

    for _ in 0..120 {
        evolution.advance_one_time_step(1.0 / 60.0);
    }

    assert_abs_diff_eq!(evolution.particles().x()[0].z, 0.1, epsilon = 1e-4);
    assert!(evolution.particles().v()[0].length() < 1e-2);
    let contact = evolution.contacts()[0];
    assert!(contact.is_contact());
    assert_eq!(contact.collider, 0);
    assert_abs_diff_eq!(contact.normal.z, 1.0, epsilon = 1e-5);
    assert!(evolution.collision_particles().collided(0));
}

#[test]
fn colliders_skip_other_groups() {
    let mut evolution = Evolution::new(SolverConfig::default()).unwrap();
    evolution.add_particles(1, 1);
    evolution.particles_mut().set_position(0, Vec3::new(0.0, 0.0, 0.5));
    evolution.add_collision_particle(CollisionGeometry::Plane, RigidPose::default(), 2);

    for _ in 0..30 {
        evolution.advance_one_time_step(1.0 / 60.0);
    }

    assert!(evolution.particles().x()[0].z < 0.0);
    assert!(!evolution.contacts()[0].is_contact());
    assert!(!evolution.collision_particles().collided(0));
}

#[test]
fn ccd_stops_fast_particles_at_thin_walls() {
    let mut evolution = Evolution::new(SolverConfig::default()).unwrap();
    *evolution.groups_mut().get_mut(0) = ParticleGroup {
        gravity: Vec3::ZERO,
        use_ccd: true,
        ..ParticleGroup::default()
    };
    evolution.add_particles(1, 0);
    evolution.particles_mut().set_position(0, Vec3::new(0.0, 0.0, 1.0));
    evolution.particles_mut().set_velocity(0, Vec3::new(0.0, 0.0, -200.0));
    evolution.add_collision_particle(
        CollisionGeometry::Box {
            half_extents: Vec3::new(10.0, 10.0, 0.01),
        },
        RigidPose::default(),
        0,
    );

    evolution.advance_one_time_step(0.01);

    assert!(evolution.particles().x()[0].z > 0.0);
    assert!(evolution.contacts()[0].is_contact());
}

fn build_chains(config: SolverConfig, chains: u32) -> Evolution {
    let mut evolution = Evolution::new(config).unwrap();
    let mut springs = SpringConstraints::new();
    for chain in 0..chains {
        add_hanging_chain(&mut evolution, &mut springs, Vec3::Y * (2.0 * chain as f32), 5);
    }
    evolution.add_constraint_rule(springs);
    evolution
}

fn run(evolution: &mut Evolution, steps: u32) -> Vec<Vec3> {
    for _ in 0..steps {
        evolution.advance_one_time_step(1.0 / 60.0);
    }
    evolution.particles().x().to_vec()
}

#[test]
fn island_dispatch_matches_serial_dispatch() {
    let serial_config = SolverConfig::default().with_islands(false);
    let mut serial = build_chains(serial_config, 8);
    let expected = run(&mut serial, 20);

    let configs = [
        SolverConfig::default().with_levels(false).with_colors(false),
        SolverConfig::default().with_colors(false),
        SolverConfig::default()
            .with_min_particles_for_coloring(1)
            .with_min_parallel_batch_size(1),
    ];
    for config in configs {
        let mut parallel = build_chains(config, 8).with_thread_dispatcher(Arc::new(ThreadDispatcher::new(4)));
        let actual = run(&mut parallel, 20);
        for (a, b) in actual.iter().zip(&expected) {
            assert_abs_diff_eq!(a.x, b.x, epsilon = 1e-4);
            assert_abs_diff_eq!(a.y, b.y, epsilon = 1e-4);
            assert_abs_diff_eq!(a.z, b.z, epsilon = 1e-4);
        }
        assert_eq!(parallel.counters().islands, 8);
    }
}

/// Triangulated sheet of `SIDE x SIDE` jittered particles in the XZ plane, hanging from a kinematic top row.
/// Every spring starts at its rest length, so the pinned sheet has a single nearby solution.
fn build_braced_sheet(config: SolverConfig) -> (Evolution, usize, Vec<Vec3>) {
    const SIDE: u32 = 7;
    let mut evolution = Evolution::new(config).unwrap();
    let first = evolution.add_particles(SIDE * SIDE, 0);
    let index = |row: u32, column: u32| first + row * SIDE + column;
    {
        let particles = evolution.particles_mut();
        for row in 0..SIDE {
            for column in 0..SIDE {
                let jitter = Vec3::new(
                    ((row * 7 + column * 3) % 5) as f32 * 0.04 - 0.08,
                    0.0,
                    ((row * 3 + column * 5) % 7) as f32 * 0.03 - 0.09,
                );
                particles.set_position(
                    index(row, column),
                    Vec3::new(column as f32, 0.0, -(row as f32)) + jitter,
                );
            }
        }
        for column in 0..SIDE {
            particles.set_kinematic(index(0, column));
        }
    }
    let mut springs = SpringConstraints::new();
    let particles = evolution.particles();
    for row in 0..SIDE {
        for column in 0..SIDE {
            if column + 1 < SIDE {
                springs.add_constraint_at_rest(particles, [index(row, column), index(row, column + 1)], 1.0);
            }
            if row + 1 < SIDE {
                springs.add_constraint_at_rest(particles, [index(row, column), index(row + 1, column)], 1.0);
            }
            if row + 1 < SIDE && column + 1 < SIDE {
                springs.add_constraint_at_rest(particles, [index(row, column), index(row + 1, column + 1)], 1.0);
            }
        }
    }
    let rest = particles.x().to_vec();
    let rule = evolution.add_constraint_rule(springs);
    (evolution, rule, rest)
}

#[test]
fn level_color_order_converges_like_index_order() {
    let iterations = 256;
    let (mut serial, _, rest) = build_braced_sheet(SolverConfig::default().with_islands(false).with_iterations(iterations));
    let expected = run(&mut serial, 1);

    let configs = [
        SolverConfig::default().with_levels(false).with_colors(false),
        SolverConfig::default()
            .with_min_particles_for_coloring(1)
            .with_min_parallel_batch_size(1),
    ];
    for config in configs {
        let colored = config.use_colors;
        let (evolution, rule, _) = build_braced_sheet(config.with_iterations(iterations));
        let mut evolution = evolution.with_thread_dispatcher(Arc::new(ThreadDispatcher::new(4)));
        let actual = run(&mut evolution, 1);

        let order: Vec<u32> = evolution
            .rule::<SpringConstraints>(rule)
            .unwrap()
            .island_constraint_order()
            .flatten()
            .copied()
            .collect();
        let mut ascending = order.clone();
        ascending.sort_unstable();
        if colored {
            assert_eq!(evolution.counters().colored_islands, 1);
            assert_ne!(order, ascending);
        }

        // Different solve orders agree once the sheet has been projected back onto its rest shape.
        for ((a, b), r) in actual.iter().zip(&expected).zip(&rest) {
            assert_abs_diff_eq!(a.x, b.x, epsilon = 1e-4);
            assert_abs_diff_eq!(a.y, b.y, epsilon = 1e-4);
            assert_abs_diff_eq!(a.z, b.z, epsilon = 1e-4);
            assert_abs_diff_eq!(a.distance(*r), 0.0, epsilon = 1e-4);
        }
    }
}

#[test]
fn disabled_constraints_count_as_skipped_in_every_dispatch_mode() {
    for config in [
        SolverConfig::default().with_islands(false),
        SolverConfig::default().with_colors(false),
        SolverConfig::default(),
    ] {
        let mut evolution = Evolution::new(config).unwrap();
        weightless(&mut evolution, 0);
        evolution.add_particles(4, 0);
        let mut springs = SpringConstraints::new();
        springs.add_constraint([0, 1], 1.0, 1.0);
        let disabled = springs.add_constraint([2, 3], 1.0, 1.0);
        springs.set_enabled(disabled, false);
        evolution.add_constraint_rule(springs);

        evolution.advance_one_time_step(1.0 / 60.0);

        let counters = evolution.counters();
        assert_eq!((counters.constraints_gathered, counters.constraints_skipped), (1, 1));
    }
}

#[test]
fn colored_grid_solves_in_parallel() {
    const SIDE: u32 = 12;
    let config = SolverConfig::default()
        .with_min_particles_for_coloring(16)
        .with_min_parallel_batch_size(4);
    let mut evolution = Evolution::new(config)
        .unwrap()
        .with_thread_dispatcher(Arc::new(ThreadDispatcher::new(4)));
    let first = evolution.add_particles(SIDE * SIDE, 0);
    let index = |row: u32, column: u32| first + row * SIDE + column;
    let mut springs = SpringConstraints::new();
    {
        let particles = evolution.particles_mut();
        for row in 0..SIDE {
            for column in 0..SIDE {
                particles.set_position(index(row, column), Vec3::new(column as f32, 0.0, -(row as f32)));
            }
        }
        for column in 0..SIDE {
            particles.set_kinematic(index(0, column));
        }
    }
    for row in 0..SIDE {
        for column in 0..SIDE {
            if column + 1 < SIDE {
                springs.add_constraint([index(row, column), index(row, column + 1)], 1.0, 1.0);
            }
            if row + 1 < SIDE {
                springs.add_constraint([index(row, column), index(row + 1, column)], 1.0, 1.0);
            }
        }
    }
    let rule = evolution.add_constraint_rule(springs);

    let positions = run(&mut evolution, 10);

    let counters = *evolution.counters();
    assert_eq!(counters.islands, 1);
    assert_eq!(counters.colored_islands, 1);
    assert!(counters.max_colors >= 2);
    // Row 1 hangs off the anchors at depth 0, so the bottom row sits at depth SIDE - 2.
    assert_eq!(counters.max_level, SIDE - 2);
    assert!(positions.iter().all(|position| position.is_finite()));
    for column in 0..SIDE {
        assert_eq!(positions[index(0, column) as usize], Vec3::new(column as f32, 0.0, 0.0));
    }

    // Forcing the rule back to serial dispatch keeps the simulation well formed.
    evolution.set_rule_dispatch_mode(rule, Some(DispatchMode::IslandSerial));
    let positions = run(&mut evolution, 5);
    assert!(positions.iter().all(|position| position.is_finite()));
    assert_eq!(evolution.counters().colored_islands, 0);
}

#[test]
fn disabled_constraints_leave_the_graph() {
    let mut evolution = Evolution::new(SolverConfig::default()).unwrap();
    weightless(&mut evolution, 0);
    let mut springs = SpringConstraints::new();
    add_hanging_chain(&mut evolution, &mut springs, Vec3::ZERO, 4);
    let rule = evolution.add_constraint_rule(springs);
    evolution.advance_one_time_step(1.0 / 60.0);
    assert_eq!(evolution.graph().edge_count(), 4);
    assert_eq!(evolution.graph().islands().len(), 1);

    // Cutting the chain in the middle splits off an unanchored island.
    evolution
        .rule_mut::<SpringConstraints>(rule)
        .unwrap()
        .container_mut()
        .set_enabled(2, false);
    evolution.advance_one_time_step(1.0 / 60.0);
    let graph = evolution.graph();
    assert_eq!(graph.edge_count(), 3);
    assert_eq!(graph.islands().len(), 2);
    assert!(evolution.counters().topology_changed);
}
