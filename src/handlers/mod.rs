//! API Handlers

pub mod analytics;
pub mod discounts;
pub mod iwss;
pub mod references;
pub mod referrals;
pub mod sales;
pub mod votes;
