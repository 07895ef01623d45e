pub mod db;
pub mod helpers;
