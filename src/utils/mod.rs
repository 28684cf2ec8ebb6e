pub use object_pool::ObjectPool;

mod object_pool;
