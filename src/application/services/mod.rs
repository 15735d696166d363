pub mod datafeed;
pub mod price_feed_bridge;
pub mod scheduler;
pub mod subscription_registry;
pub mod symbol_router;

#[cfg(test)]
pub mod tests;
