pub mod assignment_repo;
pub mod node_repo;
pub mod sample_repo;
