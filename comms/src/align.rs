/// Primitive number types whose alignment is at least 4 bytes.
///
/// Receive buffers are built out of these so the `f32` payloads of a message
/// can be viewed in place without copying.
pub trait Align4: bytemuck::Pod {}

impl Align4 for u32 {}
impl Align4 for i32 {}
impl Align4 for u64 {}
impl Align4 for i64 {}
impl Align4 for f32 {}
impl Align4 for f64 {}
