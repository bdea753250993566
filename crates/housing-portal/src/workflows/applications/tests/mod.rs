mod common;
mod matching;
mod rules;
mod store;
