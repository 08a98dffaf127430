//! A bounded worker pool draining a [`Scheduler`].
//!
//! Workers execute node actions on scoped threads and report back over a
//! completion channel; the main loop keeps at most `workers` actions in
//! flight and hands every completion to the scheduler, which promotes
//! dependents or prunes them on failure. Nothing already running is ever
//! interrupted; cancellation is failure propagation only.

use crate::graph::{Dag, Scheduler};
use std::thread;

/// Runs `action` for every node of `scheduler`, at most `workers` at a time.
///
/// An action returns `None` on success or an error message; failed nodes'
/// transitive dependents are never started. Returns all `(node, error)`
/// failures. Actions must not share mutable state except through their own
/// synchronization.
pub fn run<N, F>(mut scheduler: Scheduler<N>, workers: usize, action: F) -> Vec<(N, String)>
where
    N: Dag + Send,
    F: Fn(&N) -> Option<String> + Sync,
{
    let workers = workers.max(1);
    let (sender, receiver) = crossbeam_channel::unbounded::<(N, Option<String>)>();
    let action = &action;

    thread::scope(|scope| {
        let mut running = 0usize;
        loop {
            if running < workers {
                for node in scheduler.next(workers - running) {
                    running += 1;
                    let sender = sender.clone();
                    scope.spawn(move || {
                        // a panicking action must still produce a completion
                        // message or the drain loop would block forever
                        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                            || action(&node),
                        ))
                        .unwrap_or_else(|_| Some("action panicked".to_string()));
                        let _ = sender.send((node, result));
                    });
                }
            }
            if running == 0 {
                if !scheduler.has_pending() {
                    break;
                }
                // pending but nothing ready and nothing running cannot occur
                // in an acyclic graph; bail out instead of spinning
                debug_assert!(false, "scheduler stalled with pending work");
                break;
            }
            match receiver.recv() {
                Ok((node, result)) => {
                    running -= 1;
                    scheduler.complete(&node, result);
                }
                Err(_) => break,
            }
        }
        scheduler.into_failures()
    })
}

/// The default worker count: available hardware parallelism.
pub fn default_workers() -> usize {
    num_cpus::get().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Dag;
    use std::{
        collections::HashSet,
        hash::{Hash, Hasher},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    #[derive(Clone)]
    struct Node(Arc<NodeInner>);
    struct NodeInner {
        name: &'static str,
        dependencies: Vec<Node>,
    }
    impl Node {
        fn leaf(name: &'static str) -> Node {
            Node(Arc::new(NodeInner { name, dependencies: Vec::new() }))
        }
        fn new(name: &'static str, dependencies: &[&Node]) -> Node {
            Node(Arc::new(NodeInner {
                name,
                dependencies: dependencies.iter().map(|d| (*d).clone()).collect(),
            }))
        }
    }
    impl PartialEq for Node {
        fn eq(&self, other: &Self) -> bool {
            Arc::ptr_eq(&self.0, &other.0)
        }
    }
    impl Eq for Node {}
    impl Hash for Node {
        fn hash<H: Hasher>(&self, state: &mut H) {
            (Arc::as_ptr(&self.0) as usize).hash(state)
        }
    }
    impl Dag for Node {
        fn dependencies(&self) -> Vec<Node> {
            self.0.dependencies.clone()
        }
    }

    #[test]
    fn runs_every_node_once() {
        let p1 = Node::leaf("p1");
        let p2 = Node::leaf("p2");
        let p3 = Node::leaf("p3");
        let root = Node::new("root", &[&p1, &p2, &p3]);
        let scheduler = Scheduler::new(&root, |_| 1);

        let seen = Mutex::new(Vec::new());
        let failures = run(scheduler, 2, |node| {
            seen.lock().unwrap().push(node.0.name);
            None
        });
        assert!(failures.is_empty());

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen.last(), Some(&"root"));
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn bounds_concurrency() {
        let leaves: Vec<Node> = ["a", "b", "c", "d", "e"].map(Node::leaf).into_iter().collect();
        let refs: Vec<&Node> = leaves.iter().collect();
        let root = Node::new("root", &refs);
        let scheduler = Scheduler::new(&root, |_| 1);

        let current = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let failures = run(scheduler, 2, |_| {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            current.fetch_sub(1, Ordering::SeqCst);
            None
        });
        assert!(failures.is_empty());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn failed_dependency_cancels_dependents_but_not_siblings() {
        let p1 = Node::leaf("p1");
        let p2 = Node::leaf("p2");
        let p3 = Node::leaf("p3");
        let root = Node::new("root", &[&p1, &p2, &p3]);
        let scheduler = Scheduler::new(&root, |_| 1);

        let completed = AtomicUsize::new(0);
        let failures = run(scheduler, 2, |node| {
            if node.0.name == "p2" {
                return Some("p2 failed".to_string());
            }
            completed.fetch_add(1, Ordering::SeqCst);
            None
        });

        // p1 and p3 completed, root never ran
        assert_eq!(completed.load(Ordering::SeqCst), 2);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0 .0.name, "p2");
        assert_eq!(failures[0].1, "p2 failed");
    }

    #[test]
    fn dependency_completes_before_dependent_starts() {
        let dep = Node::leaf("dep");
        let root = Node::new("root", &[&dep]);
        let scheduler = Scheduler::new(&root, |_| 1);

        let dep_done = Arc::new(AtomicUsize::new(0));
        let ordered = Arc::new(AtomicUsize::new(0));
        let failures = run(scheduler, 4, |node| {
            if node.0.name == "dep" {
                std::thread::sleep(Duration::from_millis(10));
                dep_done.store(1, Ordering::SeqCst);
            } else if dep_done.load(Ordering::SeqCst) == 1 {
                ordered.store(1, Ordering::SeqCst);
            }
            None
        });
        assert!(failures.is_empty());
        assert_eq!(ordered.load(Ordering::SeqCst), 1);
    }
}
