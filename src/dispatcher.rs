//! Schedules asynchronous calls, bounding concurrency overall and per
//! host. Overflow queues until a running call frees a slot.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use log::trace;

use crate::call::{Call, CallEngine, Callback};
use crate::task::TaskRunner;

pub(crate) struct Dispatcher {
    max_requests: usize,
    max_requests_per_host: usize,
    task_runner: TaskRunner,
    state: Mutex<State>,
    idle_callback: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

struct State {
    ready_async: VecDeque<AsyncCall>,
    running_async: Vec<RunningCall>,
    running_sync: Vec<Arc<CallEngine>>,
}

struct AsyncCall {
    call: Call,
    callback: Box<dyn Callback>,
    host: String,
}

struct RunningCall {
    engine: Arc<CallEngine>,
    host: String,
}

impl Dispatcher {
    pub(crate) fn new(
        task_runner: TaskRunner,
        max_requests: usize,
        max_requests_per_host: usize,
    ) -> Dispatcher {
        Dispatcher {
            max_requests,
            max_requests_per_host,
            task_runner,
            state: Mutex::new(State {
                ready_async: VecDeque::new(),
                running_async: Vec::new(),
                running_sync: Vec::new(),
            }),
            idle_callback: Mutex::new(None),
        }
    }

    /// Runs `callback` whenever the dispatcher becomes idle.
    pub(crate) fn set_idle_callback(&self, callback: Option<Box<dyn Fn() + Send + Sync>>) {
        *self.idle_callback.lock().unwrap() = callback;
    }

    pub(crate) fn enqueue(&self, call: Call, callback: Box<dyn Callback>) {
        let host = call.engine.host();
        {
            let mut state = self.state.lock().unwrap();
            state.ready_async.push_back(AsyncCall {
                call,
                callback,
                host,
            });
        }
        self.promote_and_execute();
    }

    /// Registers a synchronous call for accounting and cancel-all.
    pub(crate) fn executed(&self, call: Call) {
        self.state.lock().unwrap().running_sync.push(call.engine.clone());
    }

    pub(crate) fn finished(&self, engine: &Arc<CallEngine>) {
        {
            let mut state = self.state.lock().unwrap();
            state.running_sync.retain(|e| !Arc::ptr_eq(e, engine));
        }
        self.promote_and_execute();
        self.maybe_idle();
    }

    fn finished_async(&self, engine: &Arc<CallEngine>) {
        {
            let mut state = self.state.lock().unwrap();
            state.running_async.retain(|r| !Arc::ptr_eq(&r.engine, engine));
        }
        self.promote_and_execute();
        self.maybe_idle();
    }

    /// Moves ready calls into the running set while both caps allow.
    fn promote_and_execute(&self) {
        let mut executable: Vec<AsyncCall> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let mut index = 0;
            while index < state.ready_async.len() {
                if state.running_async.len() + executable.len() >= self.max_requests {
                    break;
                }
                let host = state.ready_async[index].host.clone();
                let host_count = state
                    .running_async
                    .iter()
                    .filter(|r| r.host == host)
                    .count()
                    + executable.iter().filter(|c| c.host == host).count();
                if host_count >= self.max_requests_per_host {
                    index += 1;
                    continue;
                }
                let async_call = state.ready_async.remove(index).expect("index in bounds");
                state.running_async.push(RunningCall {
                    engine: async_call.call.engine.clone(),
                    host: async_call.host.clone(),
                });
                executable.push(async_call);
            }
        }

        for async_call in executable {
            trace!("dispatching async call to {}", async_call.host);
            let queue = self.task_runner.new_queue();
            queue.execute("async call", 0, true, move || {
                let AsyncCall { call, callback, .. } = async_call;
                let engine = call.engine.clone();
                let client = engine.client().clone();
                let result = engine.execute_blocking();
                client.dispatcher.finished_async(&engine);
                match result {
                    Ok(response) => callback.on_response(call, response),
                    Err(error) => callback.on_failure(call, error),
                }
            });
        }
    }

    fn maybe_idle(&self) {
        let idle = {
            let state = self.state.lock().unwrap();
            state.ready_async.is_empty()
                && state.running_async.is_empty()
                && state.running_sync.is_empty()
        };
        if idle {
            if let Some(ref callback) = *self.idle_callback.lock().unwrap() {
                callback();
            }
        }
    }

    /// Cancels every call, queued or running.
    pub(crate) fn cancel_all(&self) {
        let (ready, running): (Vec<Call>, Vec<Arc<CallEngine>>) = {
            let state = self.state.lock().unwrap();
            (
                state.ready_async.iter().map(|c| c.call.clone()).collect(),
                state
                    .running_async
                    .iter()
                    .map(|r| r.engine.clone())
                    .chain(state.running_sync.iter().cloned())
                    .collect(),
            )
        };
        for call in ready {
            call.cancel();
        }
        for engine in running {
            engine.cancel();
        }
    }

    pub(crate) fn queued_calls_count(&self) -> usize {
        self.state.lock().unwrap().ready_async.len()
    }

    pub(crate) fn running_calls_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.running_async.len() + state.running_sync.len()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("max_requests", &self.max_requests)
            .field("max_requests_per_host", &self.max_requests_per_host)
            .finish()
    }
}
