//! Interpreter benchmarks: compilation and stepping.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

use harel_core::{initialize, macrostep, Event, Machine, NoopRunner};

fn toggle_machine() -> Machine {
    Machine::from_json(&json!({
        "id": "toggle",
        "initial": "off",
        "states": {
            "off": {"on": {"FLIP": {"target": "on"}}},
            "on": {"on": {"FLIP": {"target": "off"}}}
        }
    }))
    .unwrap()
}

/// Linear chain of nested compound states, `depth` levels deep, with a
/// transition from the innermost leaf back to the outermost state.
fn deep_machine(depth: usize) -> Machine {
    let mut state = json!({"on": {"RESET": {"target": "level0"}}});
    for level in (1..depth).rev() {
        state = json!({
            "initial": format!("level{}", level + 1),
            "states": {format!("level{}", level + 1): state}
        });
    }
    Machine::from_json(&json!({
        "id": "deep",
        "initial": "level0",
        "states": {
            "level0": {
                "initial": "level1",
                "states": {"level1": state},
                "id": "level0"
            }
        }
    }))
    .unwrap()
}

fn parallel_machine(regions: usize) -> Machine {
    let mut states = serde_json::Map::new();
    for region in 0..regions {
        states.insert(
            format!("region{}", region),
            json!({
                "initial": "idle",
                "states": {
                    "idle": {"on": {"TICK": {"target": "busy"}}},
                    "busy": {"on": {"TICK": {"target": "idle"}}}
                }
            }),
        );
    }
    Machine::from_json(&json!({
        "id": "grid",
        "initial": "work",
        "states": {
            "work": {"type": "parallel", "states": states}
        }
    }))
    .unwrap()
}

fn counter_machine() -> Machine {
    Machine::from_json(&json!({
        "id": "counter",
        "initial": "counting",
        "context": {"n": 0},
        "states": {
            "counting": {
                "on": {
                    "INC": {
                        "guard": "ctx.n < 1000000",
                        "actions": [{"type": "assign", "set": {"n": {"$expr": "ctx.n + 1"}}}]
                    }
                }
            }
        }
    }))
    .unwrap()
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");

    let simple = json!({
        "id": "toggle",
        "initial": "off",
        "states": {
            "off": {"on": {"FLIP": {"target": "on"}}},
            "on": {"on": {"FLIP": {"target": "off"}}}
        }
    });
    group.bench_function("simple", |b| {
        b.iter(|| black_box(Machine::from_json(&simple).unwrap()))
    });

    // Wide flat machine: many sibling states, one transition each.
    let mut states = serde_json::Map::new();
    for i in 0..50 {
        states.insert(
            format!("s{}", i),
            json!({"on": {"NEXT": {"target": format!("s{}", (i + 1) % 50)}}}),
        );
    }
    let wide = json!({"id": "wide", "initial": "s0", "states": states});
    group.bench_function("wide_50_states", |b| {
        b.iter(|| black_box(Machine::from_json(&wide).unwrap()))
    });

    group.finish();
}

fn bench_initialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("initialize");

    let flat = toggle_machine();
    group.bench_function("flat", |b| {
        b.iter(|| black_box(initialize(&flat, None, &mut NoopRunner).unwrap()))
    });

    let deep = deep_machine(8);
    group.bench_function("deep_8_levels", |b| {
        b.iter(|| black_box(initialize(&deep, None, &mut NoopRunner).unwrap()))
    });

    let parallel = parallel_machine(8);
    group.bench_function("parallel_8_regions", |b| {
        b.iter(|| black_box(initialize(&parallel, None, &mut NoopRunner).unwrap()))
    });

    group.finish();
}

fn bench_macrostep(c: &mut Criterion) {
    let mut group = c.benchmark_group("macrostep");
    group.throughput(Throughput::Elements(1));

    // Steady-state toggling needs no per-iteration setup.
    let toggle = toggle_machine();
    let mut toggle_state = initialize(&toggle, None, &mut NoopRunner).unwrap();
    let flip = Event::new("FLIP");
    group.bench_function("flat_transition", |b| {
        b.iter(|| {
            macrostep(&toggle, &mut toggle_state, &flip, &mut NoopRunner).unwrap();
            black_box(&toggle_state);
        })
    });

    let counter = counter_machine();
    let mut counter_state = initialize(&counter, None, &mut NoopRunner).unwrap();
    let inc = Event::new("INC");
    group.bench_function("guard_and_assign", |b| {
        b.iter(|| {
            macrostep(&counter, &mut counter_state, &inc, &mut NoopRunner).unwrap();
            black_box(&counter_state);
        })
    });

    let unhandled = Event::new("NOBODY_LISTENS");
    group.bench_function("unhandled_event", |b| {
        b.iter(|| {
            macrostep(&counter, &mut counter_state, &unhandled, &mut NoopRunner).unwrap();
            black_box(&counter_state);
        })
    });

    for depth in [4, 8, 16] {
        let machine = deep_machine(depth);
        let base = initialize(&machine, None, &mut NoopRunner).unwrap();
        let reset = Event::new("RESET");
        group.bench_with_input(
            BenchmarkId::new("deep_exit_reenter", depth),
            &depth,
            |b, _| {
                b.iter(|| {
                    let mut state = base.clone();
                    macrostep(&machine, &mut state, &reset, &mut NoopRunner).unwrap();
                    black_box(state)
                })
            },
        );
    }

    for regions in [2, 8] {
        let machine = parallel_machine(regions);
        let mut state = initialize(&machine, None, &mut NoopRunner).unwrap();
        let tick = Event::new("TICK");
        group.bench_with_input(
            BenchmarkId::new("parallel_broadcast", regions),
            &regions,
            |b, _| {
                b.iter(|| {
                    macrostep(&machine, &mut state, &tick, &mut NoopRunner).unwrap();
                    black_box(&state);
                })
            },
        );
    }

    group.finish();
}

fn bench_state_value(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_value");

    let machine = parallel_machine(8);
    let state = initialize(&machine, None, &mut NoopRunner).unwrap();
    group.bench_function("compose_parallel_8", |b| {
        b.iter(|| black_box(state.value(&machine)))
    });

    let value = state.value(&machine);
    group.bench_function("restore_from_value", |b| {
        b.iter(|| {
            black_box(
                harel_core::MachineState::restore(&machine, &value, serde_json::Value::Null)
                    .unwrap(),
            )
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_compile,
    bench_initialize,
    bench_macrostep,
    bench_state_value,
);

criterion_main!(benches);
