/// RenderWindow trait - the window contract the device presents to

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// A window the graphics device can create a surface for
///
/// Implemented for `winit::window::Window`. The device polls `pixel_size`
/// while the window is minimized (zero extent) before rebuilding the swapchain.
pub trait RenderWindow: HasWindowHandle + HasDisplayHandle + Send + Sync {
    /// Drawable size in physical pixels
    fn pixel_size(&self) -> (u32, u32);

    /// Yield to the windowing system while the window has no drawable area
    fn wait_events(&self);
}

impl RenderWindow for winit::window::Window {
    fn pixel_size(&self) -> (u32, u32) {
        let size = self.inner_size();
        (size.width, size.height)
    }

    fn wait_events(&self) {
        // winit 0.30 drives events from the application's event loop; back off
        // instead of spinning until the next resize arrives.
        std::thread::sleep(std::time::Duration::from_millis(16));
    }
}
