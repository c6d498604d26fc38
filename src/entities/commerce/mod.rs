/// Catalog, cart and customer-address entities
pub mod address;
pub mod cart;
pub mod cart_line;
pub mod product;
pub mod product_price;
