pub mod candidates;
pub mod clock;
pub mod config;
pub mod db;
pub mod ledger;
pub mod model;
pub mod notifier;
pub mod queue;
pub mod scheduler;
pub mod sender;
pub mod timezone;
pub mod worker;
