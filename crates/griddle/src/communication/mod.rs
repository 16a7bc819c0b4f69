mod item;
mod queue_item;

pub(crate) use item::Item;
pub(crate) use queue_item::QueueItem;
