//! opcodebox: sandboxed random-opcode stress worker
//! Synthesizes byte streams, maps them executable and runs them as machine
//! code in a disposable child process, one generation at a time
//!
//! # Architecture
//!
//! ## Generation ([`generator`], [`counter`])
//! - [`generator::random`]: fresh random 32-bit words
//! - [`generator::incrementing`]: the execution counter replicated per slot
//! - [`generator::mixed`]: counter and random values through fixed bit transforms
//! - [`generator::text`]: this program's own code with sparse bit flips
//! - [`counter`]: execution counter partitioning and advance
//!
//! ## Memory ([`arena`])
//! - Guarded arena: guard pages, a wide fill region, one executable page
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::capabilities`]: capability drop, no_new_privs, core dumps
//! - [`kernel::seccomp`]: static syscall allow-list
//! - [`kernel::signal`]: fault handlers, signal tally, shutdown flag
//! - [`kernel::timer`]: watchdog and parent-death arming
//! - [`kernel::probe`]: host capability check
//! - [`kernel::text`]: executable segment lookup
//!
//! ## Execution Control ([`exec`])
//! - [`exec::harness`]: harness interface and budget harness
//! - `exec::child`: type-state sandboxed child
//! - `exec::worker`: fork, reap and count loop
//!
//! # Design Principles
//!
//! 1. **The process boundary is the error barrier** - nothing a child does reaches the parent
//! 2. **Nothing after fork allocates** - the child may be a copy of a threaded process
//! 3. **Types order the setup** - code cannot run before every protection is armed
//! 4. **Fill wide, execute one page** - generators get slack, the live surface stays small

pub mod config;
pub mod counter;
pub mod exec;
pub mod generator;

#[cfg(target_os = "linux")]
pub mod arena;
#[cfg(target_os = "linux")]
pub mod kernel;
#[cfg(target_os = "linux")]
pub mod utils;

// CLI entrypoint wiring for the opcodebox binary.
#[cfg(target_os = "linux")]
pub mod cli;

pub use config::types::*;
pub use exec::stress_opcode;
