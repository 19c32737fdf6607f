use super::{
    divisive::Divisive, layered::Layered, store::OptimizationResultStore, test_spec, MethodSpec,
    OptimizationError, OptimizationMethod, OptimizationStrategy,
};
use crate::{
    params::{NamedParameter, ParameterSet, ProgramParameter},
    quality::{QualitySet, QualityValue},
};
use std::{fs, sync::mpsc, sync::Arc, thread, time::Duration};
use tempfile::TempDir;

/// Replays a fixed list of sets, including repetitions.
#[derive(Debug)]
struct Scripted {
    sets: Vec<ParameterSet>,
    position: usize,
}

impl OptimizationStrategy for Scripted {
    fn init_parameter_values(&mut self, _spec: &MethodSpec) -> Result<(), OptimizationError> {
        self.position = 0;
        Ok(())
    }

    fn has_next(&self) -> bool {
        self.position < self.sets.len()
    }

    fn next_parameter_set(
        &mut self,
        forced: Option<&ParameterSet>,
        _store: &OptimizationResultStore,
        _spec: &MethodSpec,
    ) -> Result<ParameterSet, OptimizationError> {
        let set = self.sets.get(self.position).cloned();
        self.position += 1;

        match forced {
            Some(forced) => Ok(forced.clone()),
            None => set.ok_or_else(|| OptimizationError::NoParameterSetFound("script ended".to_owned())),
        }
    }

    fn total_iteration_count(&self) -> usize {
        self.sets.len()
    }
}

fn t_parameter() -> NamedParameter {
    NamedParameter::new(
        "T",
        ProgramParameter::Double {
            min: 0.0,
            max: 10.0,
            default: 0.0,
            options: Vec::new(),
        },
    )
}

fn t(value: &str) -> ParameterSet {
    [("T", value)].into_iter().collect()
}

fn f1(value: f64) -> QualitySet {
    [
        ("F1", QualityValue::Value(value)),
        ("Runtime", QualityValue::Value(1.0)),
    ]
    .into_iter()
    .collect()
}

fn divisive_method(resume: bool) -> OptimizationMethod {
    let mut spec = test_spec(vec![t_parameter()], 5);
    spec.resume = resume;
    OptimizationMethod::new(spec, Box::new(Divisive::new(vec![t_parameter()], 5)))
}

#[test]
pub fn next_requires_reset() {
    let method = divisive_method(false);

    assert!(matches!(method.next(), Err(OptimizationError::NotReset)));
}

#[test]
pub fn iteration_numbers_have_no_gaps() {
    let dir = TempDir::new().unwrap();
    let method = divisive_method(false);
    method.reset(&dir.path().join("T.complete")).unwrap();

    // two iterations in flight at the same time
    let first = method.next().unwrap();
    let second = method.next().unwrap();
    method.give_quality_feedback(&second, f1(0.2)).unwrap();
    method.give_quality_feedback(&first, f1(0.1)).unwrap();

    while method.has_next() {
        let set = method.next().unwrap();
        method.give_quality_feedback(&set, f1(0.3)).unwrap();
    }

    let mapping = method.iteration_mapping().unwrap();
    assert_eq!(mapping.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
    assert_eq!(mapping[&1], t("0"));
    assert_eq!(method.current_count(), 5);
    assert_eq!(method.finished_count(), 5);
}

#[test]
pub fn repeated_set_is_already_evaluated() {
    let dir = TempDir::new().unwrap();
    let sets = vec![t("1"), t("2"), t("1")];
    let method = OptimizationMethod::new(
        test_spec(vec![t_parameter()], 3),
        Box::new(Scripted { sets, position: 0 }),
    );
    method.reset(&dir.path().join("T.complete")).unwrap();

    for _ in 0..2 {
        let set = method.next().unwrap();
        method.give_quality_feedback(&set, f1(0.5)).unwrap();
    }

    match method.next() {
        Err(OptimizationError::AlreadyEvaluated {
            iteration,
            previous,
            set,
        }) => {
            assert_eq!(iteration, 3);
            assert_eq!(previous, 1);
            assert_eq!(set, t("1"));
        }
        other => panic!("expected a duplicate, got {other:?}"),
    }

    let status = method.status().unwrap();
    assert_eq!(status.started, 3);
    assert_eq!(status.finished, 2);
    assert_eq!(method.iteration_mapping().unwrap().len(), 3);
}

#[test]
pub fn duplicate_rows_need_a_recorded_original() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("T.complete");
    let scripted = |resume: bool| {
        let mut spec = test_spec(vec![t_parameter()], 2);
        spec.resume = resume;
        OptimizationMethod::new(
            spec,
            Box::new(Scripted {
                sets: vec![t("5"), t("5")],
                position: 0,
            }),
        )
    };

    let method = scripted(false);
    method.reset(&path).unwrap();
    method.write_header(false).unwrap();

    // iteration 1 is still running when its duplicate is issued
    let first = method.next().unwrap();
    assert!(matches!(
        method.next(),
        Err(OptimizationError::AlreadyEvaluated {
            iteration: 2,
            previous: 1,
            ..
        })
    ));
    assert!(!method.record_duplicate(2, 1).unwrap());
    assert_eq!(fs::read_to_string(&path).unwrap(), "iteration\tT\tF1\tRuntime\n");

    // the file without the duplicate row can still be resumed
    scripted(true).reset(&path).unwrap();

    method.give_quality_feedback(&first, f1(0.5)).unwrap();
    method.record_iteration(1, &first, &f1(0.5)).unwrap();
    assert!(method.record_duplicate(2, 1).unwrap());

    let resumed = scripted(true);
    resumed.reset(&path).unwrap();
    assert_eq!(resumed.current_count(), 2);
    assert_eq!(resumed.finished_count(), 1);
}

#[test]
pub fn pending_feedback_bound_is_enforced() {
    let dir = TempDir::new().unwrap();
    let method = divisive_method(false).with_max_pending(1);
    method.reset(&dir.path().join("T.complete")).unwrap();

    let first = method.next().unwrap();
    assert!(matches!(
        method.next(),
        Err(OptimizationError::AwaitingFeedback { pending: 1 })
    ));

    method.give_quality_feedback(&first, f1(0.4)).unwrap();
    assert_eq!(method.next().unwrap(), t("2.5"));
}

#[test]
pub fn resume_reproduces_counters_and_mapping() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("T.complete");

    let original = divisive_method(false);
    original.reset(&path).unwrap();
    original.write_header(false).unwrap();
    for (iteration, quality) in [(1, 0.1), (2, 0.8), (3, 0.3)] {
        let set = original.next().unwrap();
        original.give_quality_feedback(&set, f1(quality)).unwrap();
        original.record_iteration(iteration, &set, &f1(quality)).unwrap();
    }

    let resumed = divisive_method(true);
    resumed.reset(&path).unwrap();

    assert_eq!(resumed.current_count(), original.current_count());
    assert_eq!(resumed.finished_count(), original.finished_count());
    assert_eq!(resumed.iteration_mapping().unwrap(), original.iteration_mapping().unwrap());
    assert_eq!(resumed.next().unwrap(), original.next().unwrap());

    let status = resumed.status().unwrap();
    assert_eq!(status.optimum["F1"].0, t("2.5"));
}

#[test]
pub fn resume_fills_gaps_with_the_first_set() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("T.complete");
    fs::write(
        &path,
        "iteration\tT\tF1\tRuntime\n1\t0\t0.1\t1\n2\t2.5\t0.2\t1\n3*\t1\n5\t10\t0.4\t1\n",
    )
    .unwrap();

    let method = divisive_method(true);
    method.reset(&path).unwrap();

    let mapping = method.iteration_mapping().unwrap();
    assert_eq!(mapping.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
    assert_eq!(mapping[&3], t("0"));
    assert_eq!(mapping[&4], t("0"));
    assert_eq!(mapping[&5], t("10"));
    assert_eq!(method.current_count(), 5);
    assert_eq!(method.finished_count(), 3);
    assert!(!method.has_next());
}

#[test]
pub fn resume_without_file_fails() {
    let dir = TempDir::new().unwrap();
    let method = divisive_method(true);

    assert!(matches!(
        method.reset(&dir.path().join("missing.complete")),
        Err(OptimizationError::Replay(_))
    ));
}

#[test]
pub fn layer_barrier_waits_for_feedback() {
    let dir = TempDir::new().unwrap();
    let parameter = NamedParameter::new(
        "T",
        ProgramParameter::Double {
            min: 0.0,
            max: 100.0,
            default: 0.0,
            options: Vec::new(),
        },
    );
    // 4 layers, the first one has 8 grid points
    let method = Arc::new(OptimizationMethod::new(
        test_spec(vec![parameter.clone()], 16),
        Box::new(Layered::new(vec![parameter], 16)),
    ));
    method.reset(&dir.path().join("T.complete")).unwrap();

    let mut issued = Vec::new();
    for _ in 0..8 {
        issued.push(method.next().unwrap());
    }

    let (sender, receiver) = mpsc::channel();
    let waiting = Arc::clone(&method);
    let handle = thread::spawn(move || {
        let result = waiting.next();
        sender.send(()).unwrap();
        result
    });

    assert!(receiver.recv_timeout(Duration::from_millis(300)).is_err());

    for set in &issued {
        let value: f64 = set.get("T").unwrap().parse().unwrap();
        method
            .give_quality_feedback(set, f1(-(value - 40.0).abs()))
            .unwrap();
    }

    receiver.recv_timeout(Duration::from_secs(5)).unwrap();
    let next = handle.join().unwrap().unwrap();
    let value: f64 = next.get("T").unwrap().parse().unwrap();

    // best of the first layer is 100 * 3 / 7, the window has a width of 50
    let optimum = 300.0 / 7.0;
    assert!((optimum - 25.0 - value).abs() < 1e-9);
}

#[test]
pub fn interrupt_releases_waiting_callers() {
    let dir = TempDir::new().unwrap();
    let parameter = t_parameter();
    let method = Arc::new(OptimizationMethod::new(
        test_spec(vec![parameter.clone()], 4),
        Box::new(Layered::new(vec![parameter], 4)),
    ));
    method.reset(&dir.path().join("T.complete")).unwrap();
    method.next().unwrap();
    method.next().unwrap();

    let waiting = Arc::clone(&method);
    let handle = thread::spawn(move || waiting.next());
    thread::sleep(Duration::from_millis(100));
    method.interrupt();

    assert!(matches!(
        handle.join().unwrap(),
        Err(OptimizationError::Interrupted)
    ));
}
