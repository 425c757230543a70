//! # What is Mercurius?
//!
//! Mercurius runs trading algorithms whose functions live in other processes. An algorithm is a
//! list of named functions, each one is executed by a remote worker once per date of a backtest.
//! Mercurius decides the order in which functions are called, hands every call to a connected
//! worker, collects the orders the workers return and passes them to a backtest engine.
//!
//! There are two halves to the library. The first half is the [WorkerPool](crate::pool::WorkerPool)
//! and the sockets it is built on. The second half is the session: a state machine that drives one
//! execution of a backtest at a time, either interactively over a control socket or automatically
//! from a list of executions.
//!
//! # Sockets
//!
//! Workers and callers can be written in any language, so everything that crosses a process
//! boundary is JSON in a length-prefixed frame. The [socket] module provides request/reply and
//! publish/subscribe roles over TCP. A listening socket accepts any number of peers, a requester
//! spreads its requests over them. Listening sockets scan a configured range of ports rather than
//! asking the OS for one, the range is what an operator opens up between machines.
//!
//! # Worker pool
//!
//! A processing cycle runs at one timestamp. Functions flagged run-first go first, then every
//! unflagged function, then the functions flagged run-last. Inside each group functions run one at
//! a time in the order they were declared. A parallel function is called once per symbol, with all
//! of those calls in flight together, every other function is called once with all the symbols.
//!
//! Functions share state through a [Namespace](crate::namespace::Namespace) owned by the pool. The
//! pool serves it on a second socket and flushes it at the start of every cycle. If any call fails,
//! the cycle fails and none of its orders are returned.
//!
//! # Sessions
//!
//! A manual session listens for commands: `new_execution`, `configure_execution`,
//! `run_execution`, `current_portfolio` and `stop`. Only one execution can be active. Running an
//! execution does not block the control loop, the caller can keep asking for the current portfolio
//! until the run completes and the session returns to idle.
//!
//! The engine and the repositories are traits. [RandomEngine](crate::engine::RandomEngine) and
//! [InMemoryRepository](crate::repository::InMemoryRepository) are provided so that a session can
//! be run without any external services.
pub mod algorithm;
pub mod config;
pub mod engine;
pub mod namespace;
pub mod pool;
pub mod repository;
pub mod session;
pub mod socket;
pub mod types;
pub mod wire;
pub mod worker;
