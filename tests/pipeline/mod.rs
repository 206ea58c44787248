mod multi_chain;
mod runner;
mod scenarios;
