pub mod integrity;
pub mod ledger;
pub mod materialize;
pub mod paths;
pub mod pool;
pub mod resolve;
pub mod transfer;
pub mod tree;
pub mod tree_cache;
