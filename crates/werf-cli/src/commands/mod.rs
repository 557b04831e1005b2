mod stages;
mod synchronization;

pub use stages::{stages_list, stages_lookup, stages_publish, stages_purge, stages_signatures};
pub use synchronization::{SynchronizationArgs, synchronization};
