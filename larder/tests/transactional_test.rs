// Copyright 2026 larder Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    sync::{Arc, Barrier},
    time::Duration,
};

use larder::{
    Engine, EnvironmentConfig, Error, ErrorKind, EvictorBuilder, Identity, MemoryEngine, Registry, Request,
    ServantRef, SharedEnvironment, TransactionalContext, TransactionalEvictor,
};

fn config() -> EnvironmentConfig {
    EnvironmentConfig::default().with_checkpoint_period(Duration::ZERO)
}

fn open(env: &SharedEnvironment) -> TransactionalEvictor<i64> {
    EvictorBuilder::new("counters").transactional(env).unwrap()
}

fn increment(servant: &ServantRef<i64>, _: Option<&TransactionalContext<i64>>) -> larder::Result<i64> {
    let mut value = servant.lock();
    *value += 1;
    Ok(*value)
}

fn value(evictor: &TransactionalEvictor<i64>, id: &str) -> i64 {
    evictor
        .dispatch(None, &Request::read(id), |servant, _| Ok(*servant.lock()))
        .unwrap()
}

#[test_log::test]
fn test_uncommitted_write_is_invisible_to_readers() {
    let registry = Registry::new();
    let env = registry.open("env", &config()).unwrap();
    let evictor = open(&env);
    evictor.add(None, 10, &Identity::new("a")).unwrap();
    assert_eq!(value(&evictor, "a"), 10);

    let written = Barrier::new(2);
    let checked = Barrier::new(2);
    std::thread::scope(|s| {
        let writer = s.spawn(|| {
            evictor
                .dispatch(None, &Request::write("a"), |servant, ctx| {
                    assert!(ctx.is_some());
                    *servant.lock() = 20;
                    written.wait();
                    checked.wait();
                    Ok(())
                })
                .unwrap();
        });

        written.wait();
        assert_eq!(value(&evictor, "a"), 10);
        checked.wait();
        writer.join().unwrap();
    });

    // The cached servant is invalidated after commit.
    assert_eq!(value(&evictor, "a"), 20);
}

#[test_log::test]
fn test_deadlocks_are_retried() {
    const ROUNDS: i64 = 25;

    let registry = Registry::new();
    let engine = Arc::new(MemoryEngine::new());
    let env = registry
        .open_with("env", &config(), || Ok(engine.clone() as Arc<dyn Engine>))
        .unwrap();
    let evictor = open(&env);
    evictor.add(None, 0, &Identity::new("a")).unwrap();

    engine.inject_deadlocks(4);
    std::thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                for _ in 0..ROUNDS {
                    evictor.dispatch(None, &Request::write("a"), increment).unwrap();
                }
            });
        }
    });

    assert_eq!(engine.pending_deadlocks(), 0);
    assert_eq!(engine.active_transactions(), 0);
    assert_eq!(value(&evictor, "a"), 2 * ROUNDS);
}

#[test_log::test]
fn test_deadlock_in_ambient_context_is_returned() {
    let registry = Registry::new();
    let env = registry.open("env", &config()).unwrap();
    let evictor = open(&env);
    evictor.add(None, 0, &Identity::new("a")).unwrap();
    evictor.add(None, 0, &Identity::new("b")).unwrap();

    let barrier = Barrier::new(2);
    std::thread::scope(|s| {
        let first = s.spawn(|| {
            let ctx = evictor.begin().unwrap();
            evictor.dispatch(Some(&ctx), &Request::write("a"), increment).unwrap();
            barrier.wait();
            // Blocks until the second context rolls back.
            evictor.dispatch(Some(&ctx), &Request::write("b"), increment).unwrap();
            ctx.commit().unwrap();
        });

        let ctx = evictor.begin().unwrap();
        evictor.dispatch(Some(&ctx), &Request::write("b"), increment).unwrap();
        barrier.wait();
        std::thread::sleep(Duration::from_millis(200));
        let err = evictor
            .dispatch(Some(&ctx), &Request::write("a"), increment)
            .unwrap_err();
        assert!(err.is_deadlock_of(ctx.id()));
        ctx.rollback().unwrap();
        first.join().unwrap();
    });

    assert_eq!(value(&evictor, "a"), 1);
    assert_eq!(value(&evictor, "b"), 1);
}

#[test_log::test]
fn test_committed_remove_invalidates_cache() {
    let registry = Registry::new();
    let env = registry.open("env", &config()).unwrap();
    let evictor = open(&env);
    let id = Identity::new("a");
    evictor.add(None, 1, &id).unwrap();
    assert_eq!(value(&evictor, "a"), 1);
    assert_eq!(evictor.idle_count(), 1);

    let ctx = evictor.begin().unwrap();
    let servant = evictor.remove(Some(&ctx), &id).unwrap();
    assert_eq!(*servant.lock(), 1);
    let err = evictor
        .dispatch(Some(&ctx), &Request::write("a"), increment)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotRegistered);
    ctx.rollback().unwrap();
    assert_eq!(value(&evictor, "a"), 1);

    let ctx = evictor.begin().unwrap();
    evictor.remove(Some(&ctx), &id).unwrap();
    ctx.commit().unwrap();
    assert_eq!(evictor.idle_count(), 0);
    let err = evictor
        .dispatch(None, &Request::read("a"), |servant, _| Ok(*servant.lock()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotRegistered);
    assert!(evictor.identities(None, "").unwrap().is_empty());
}

#[test_log::test]
fn test_user_error_within_nested_dispatch() {
    let registry = Registry::new();
    let env = registry.open("env", &config()).unwrap();
    let evictor = EvictorBuilder::<i64>::new("counters")
        .with_rollback_on_user_exception(true)
        .transactional(&env)
        .unwrap();
    evictor.add(None, 1, &Identity::new("a")).unwrap();
    evictor.add(None, 1, &Identity::new("b")).unwrap();

    let err = evictor
        .dispatch(None, &Request::write("a"), |servant, ctx| {
            *servant.lock() += 1;
            evictor.dispatch(ctx, &Request::write("b"), |servant, _| {
                *servant.lock() += 1;
                Err::<(), _>(Error::external(anyhow::anyhow!("insufficient funds")))
            })
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::External);
    assert_eq!(value(&evictor, "a"), 1);
    assert_eq!(value(&evictor, "b"), 1);
}

#[test_log::test]
fn test_deactivate_waits_for_in_flight_dispatch() {
    let registry = Registry::new();
    let env = registry.open("env", &config()).unwrap();
    let evictor = open(&env);
    evictor.add(None, 0, &Identity::new("a")).unwrap();

    let entered = Barrier::new(2);
    let release = Barrier::new(2);
    let (draining, refused, deactivated) = std::thread::scope(|s| {
        let dispatch = s.spawn(|| {
            evictor
                .dispatch(None, &Request::write("a"), |servant, _| {
                    entered.wait();
                    release.wait();
                    *servant.lock() += 1;
                    Ok(())
                })
                .unwrap();
        });

        entered.wait();
        let deactivate = s.spawn(|| evictor.deactivate());
        std::thread::sleep(Duration::from_millis(50));
        let draining = !deactivate.is_finished();
        let refused = evictor.begin().err().map(|e| e.kind());
        let deactivated = evictor.is_deactivated();

        release.wait();
        dispatch.join().unwrap();
        deactivate.join().unwrap();
        (draining, refused, deactivated)
    });

    assert!(draining);
    assert_eq!(refused, Some(ErrorKind::Deactivated));
    assert!(!deactivated);
    assert!(evictor.is_deactivated());
    let err = evictor
        .dispatch(None, &Request::read("a"), |servant, _| Ok(*servant.lock()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Deactivated);
    assert_eq!(evictor.begin().unwrap_err().kind(), ErrorKind::Deactivated);

    // The committed write survives in the shared environment.
    let reopened = open(&env);
    assert_eq!(value(&reopened, "a"), 1);
}

#[test_log::test]
fn test_shared_environment_references() {
    let registry = Registry::new();
    let env = registry.open("env", &config()).unwrap();
    let again = registry.open("env", &EnvironmentConfig::default()).unwrap();
    assert!(env.same_as(&again));
    assert_eq!(registry.ref_count("env"), 2);

    let evictor = open(&env);
    assert_eq!(registry.ref_count("env"), 3);
    evictor.add(None, 7, &Identity::new("a")).unwrap();

    // Another evictor on the same environment sees the committed data.
    let other = open(&again);
    assert_eq!(value(&other, "a"), 7);
    drop(other);
    drop(evictor);
    assert_eq!(registry.ref_count("env"), 2);

    drop(env);
    assert_eq!(registry.environments(), vec!["env".to_string()]);
    drop(again);
    assert!(registry.environments().is_empty());
    assert_eq!(registry.ref_count("env"), 0);

    assert!(registry.set_fatal_callback(|_| {}).is_none());
    assert!(registry.set_fatal_callback(|_| {}).is_some());
    assert!(registry.clear_fatal_callback().is_some());
}
