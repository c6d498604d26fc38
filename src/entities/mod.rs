//! sea-orm entities for the storefront schema.

pub mod commerce;
pub mod inventory_record;
pub mod order;
pub mod order_item;
pub mod order_sequence;
pub mod payment_intent;
pub mod reservation;

pub use commerce::{address, cart, cart_line, product, product_price};

pub use commerce::{
    address::{AddressKind, Entity as Address, Model as AddressModel},
    cart::{CartStatus, Entity as Cart, Model as CartModel},
    cart_line::{Entity as CartLine, Model as CartLineModel},
    product::{Entity as Product, Model as ProductModel},
    product_price::{Entity as ProductPrice, Model as ProductPriceModel, PriceTier},
};
pub use inventory_record::{Entity as InventoryRecord, Model as InventoryRecordModel};
pub use order::{AddressSnapshot, Entity as Order, Model as OrderModel, OrderStatus, PaymentStatus};
pub use order_item::{Entity as OrderItem, Model as OrderItemModel};
pub use order_sequence::{Entity as OrderSequence, Model as OrderSequenceModel};
pub use payment_intent::{Entity as PaymentIntent, IntentStatus, Model as PaymentIntentModel};
pub use reservation::{Entity as Reservation, Model as ReservationModel, ReservationStatus};
