pub mod clients;
pub mod hostname;
pub mod oui;
pub mod rate;
