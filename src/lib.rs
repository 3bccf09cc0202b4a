pub mod config;
pub mod db;
pub mod delivery;
pub mod dispatch;
pub mod model;
pub mod personalize;
