//! Assertions about [`LoopFuture`]s that should already have fired.
//!
//! These never block: a unit that is still running counts as "no result".

use std::fmt::Debug;

use crate::error::LoopError;
use crate::event_loop::LoopFuture;

/// Panics if the unit has already finished.
#[track_caller]
pub fn assert_no_result<T>(fut: &LoopFuture<T>) {
    if fut.is_fired() {
        panic!("no result expected, but {fut:?} has fired");
    }
}

/// Take the value of a unit that finished with `Ok`.
#[track_caller]
pub fn assert_succeeded<T, E: Debug>(fut: &LoopFuture<Result<T, E>>) -> T {
    match fut.extract() {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => panic!("success expected, found failure instead: {e:?}"),
        Err(LoopError::NotFired) => panic!("success expected, found no result instead"),
        Err(e) => panic!("success expected, found {e} instead"),
    }
}

/// Take the error of a unit that finished with `Err`.
#[track_caller]
pub fn assert_failed<T: Debug, E>(fut: &LoopFuture<Result<T, E>>) -> E {
    match fut.extract() {
        Ok(Err(e)) => e,
        Ok(Ok(value)) => panic!("failure expected, found success ({value:?}) instead"),
        Err(LoopError::NotFired) => panic!("failure expected, found no result instead"),
        Err(e) => panic!("failure expected, found {e} instead"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoopRunner;
    use std::time::Duration;

    fn settle<T>(fut: &LoopFuture<T>) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !fut.is_fired() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn succeeded_and_failed() {
        let runner = EventLoopRunner::started("assertions").unwrap();

        let ok = runner.run_in_loop(async { Ok::<_, String>(42) }).unwrap();
        settle(&ok);
        assert_eq!(assert_succeeded(&ok), 42);

        let bad = runner.run_in_loop(async { Err::<u8, _>("nope".to_string()) }).unwrap();
        settle(&bad);
        assert_eq!(assert_failed(&bad), "nope");
    }

    #[test]
    fn pending_has_no_result() {
        let runner = EventLoopRunner::started("assertions").unwrap();
        let pending = runner
            .run_in_loop(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<(), String>(())
            })
            .unwrap();
        assert_no_result(&pending);
    }

    #[test]
    #[should_panic(expected = "found no result instead")]
    fn succeeded_panics_while_pending() {
        let runner = EventLoopRunner::started("assertions").unwrap();
        let pending = runner
            .run_in_loop(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<(), String>(())
            })
            .unwrap();
        assert_succeeded(&pending);
    }

    #[test]
    #[should_panic(expected = "failure expected, found success")]
    fn failed_panics_on_success() {
        let runner = EventLoopRunner::started("assertions").unwrap();
        let ok = runner.run_in_loop(async { Ok::<_, String>(1) }).unwrap();
        settle(&ok);
        assert_failed(&ok);
    }
}
