pub mod crypto_pay;
pub mod subscription;
pub mod sweep;
pub mod telegram;

#[cfg(test)]
pub mod testing;
