pub mod cron;
pub mod sweep;
pub mod watcher;

pub use cron::CronSchedule;
pub use sweep::{RenewalScheduler, RenewalStatus, SweepReport};
pub use watcher::CertWatcher;
