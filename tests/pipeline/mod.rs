mod liveness;
mod runner;
mod shutdown;
mod watchdog;
