pub mod modules;
pub mod run;
pub mod table;
