// pl-relay: The shared background agent that federates tabs.
//
// The relay holds no RPC logic; it routes.  Per channel it owns the tab
// roster and the shared-state dictionary, both mutated only on the relay's
// own task, so no cross-tab locking exists anywhere in the system.

pub mod service;

pub use service::{Relay, RelayHandle};
