pub mod commit;
pub mod dataset;
pub mod inventory;
pub mod method;
pub mod release;
pub mod ticket;
