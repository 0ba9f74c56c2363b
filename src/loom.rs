pub mod models {
    use core::array;
    use core::sync::atomic::Ordering::Relaxed;

    use loom::sync::atomic::AtomicBool;
    use loom::sync::Arc;
    use loom::{model, thread};

    use crate::lock::DelegateLock;
    use crate::park::Parker;
    use crate::publication::{Node, PublicationList};
    use crate::test::{lock_get, lock_inc, Int, LockNew};

    // TODO: Three or more threads make these models run for too long. A
    // third participant would cover a registration racing with two others on
    // the list head instead of just one.
    const THREADS: usize = 2;

    /// Evaluates that concurrent calls serialize all mutations against the
    /// shared data, therefore no data races.
    pub fn lock_join<L>()
    where
        L: LockNew<Target = Int> + DelegateLock<Target = Int> + Send + Sync + 'static,
    {
        model(|| {
            let lock = Arc::new(L::new(0));
            let handles: [_; THREADS] = array::from_fn(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || lock_inc(&*lock))
            });
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(lock_get(&*lock), THREADS as Int);
        });
    }

    /// Evaluates that participants registering at the same time all end up
    /// reachable from the list head.
    pub fn concurrent_registration() {
        model(|| {
            let list = Arc::new(PublicationList::<Int, ()>::new());
            let nodes: [Arc<Node<Int, ()>>; THREADS] = array::from_fn(|_| Arc::new(Node::new()));
            let handles: [_; THREADS] = array::from_fn(|i| {
                let list = Arc::clone(&list);
                let node = Arc::clone(&nodes[i]);
                thread::spawn(move || list.ensure_registered(&node))
            });
            for handle in handles {
                handle.join().unwrap();
            }
            let mut linked = 0;
            // SAFETY: Every other participant has been joined.
            unsafe { list.for_each(|_| linked += 1) };
            assert_eq!(linked, THREADS);
            assert!(nodes.iter().all(|node| node.is_active()));
        });
    }

    /// Evaluates that a token handed to a parker publishes the writes made
    /// before it, whether or not the owner was already waiting.
    pub fn parker_handoff() {
        model(|| {
            let parker = Arc::new(Parker::new());
            let ready = Arc::new(AtomicBool::new(false));
            let handle = {
                let parker = Arc::clone(&parker);
                let ready = Arc::clone(&ready);
                thread::spawn(move || {
                    ready.store(true, Relaxed);
                    parker.wake_one();
                })
            };
            parker.wait();
            assert!(ready.load(Relaxed));
            handle.join().unwrap();
        });
    }
}
