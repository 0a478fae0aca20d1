pub mod assemble;
pub mod layers;
pub mod normalize;
pub mod rest;
pub mod rolling;
pub mod season;
pub mod side_tables;
pub mod table;
pub mod target;
pub mod team_strength;
