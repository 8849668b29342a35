/// RenderSystem - drives one frame per tick through the graphics device

use std::sync::{Arc, Mutex};
use crate::error::{Error, Result};
use crate::graphics_device::{GraphicsDevice, CommandList, Texture, FrameBegin, ImageLayout, SubresourceRange};

/// What the render callback gets to work with for one frame
pub struct FrameContext<'a> {
    pub frame_index: usize,
    pub back_buffer: Arc<dyn Texture>,
    pub depth_buffer: Option<Arc<dyn Texture>>,
    pub extent: (u32, u32),
    /// Open command list (between `begin` and `end`)
    pub command_list: &'a mut dyn CommandList,
}

/// Per-frame recording callback
pub type RenderCallback = Box<dyn FnMut(&mut FrameContext) -> Result<()> + Send>;

/// Owns the device handle and the per-frame callback
pub struct RenderSystem {
    device: Arc<Mutex<dyn GraphicsDevice>>,
    render_callback: Option<RenderCallback>,
    frames_rendered: u64,
}

impl RenderSystem {
    pub fn new(device: Arc<Mutex<dyn GraphicsDevice>>) -> Self {
        Self { device, render_callback: None, frames_rendered: 0 }
    }

    pub fn device(&self) -> &Arc<Mutex<dyn GraphicsDevice>> {
        &self.device
    }

    /// Replace the callback invoked once per rendered frame
    pub fn set_render_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&mut FrameContext) -> Result<()> + Send + 'static,
    {
        self.render_callback = Some(Box::new(callback));
    }

    pub fn clear_render_callback(&mut self) {
        self.render_callback = None;
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    /// Run one frame: begin, record through the callback, submit, present
    ///
    /// Returns `Ok(false)` when the frame was skipped (swapchain rebuilt).
    /// `Error::DeviceLost` is returned to the caller, which must stop the loop.
    /// Any other failure still closes the frame, so the next call starts clean:
    /// what was recorded is presented when possible, otherwise the frame is
    /// abandoned. The original error is returned in both cases.
    pub fn render_frame(&mut self) -> Result<bool> {
        let mut device = self.device.lock()
            .map_err(|_| Error::BackendError("GraphicsDevice lock poisoned".to_string()))?;

        match device.begin_frame()? {
            FrameBegin::Skipped => {
                crate::engine_debug!(LOG_SOURCE, "Frame skipped (swapchain recreated)");
                return Ok(false);
            }
            FrameBegin::Ready => {}
        }

        let mut command_list = match device.create_command_list().and_then(|mut list| list.begin().map(|()| list)) {
            Ok(list) => list,
            Err(err) => return Err(abandon(&mut *device, err)),
        };

        let recorded = record(&*device, command_list.as_mut(), self.render_callback.as_mut());
        if let Err(err) = &recorded {
            if err.is_fatal() {
                return Err(err.clone());
            }
            crate::engine_warn!(LOG_SOURCE, "Render callback failed: {}", err);
        }

        // Leave the back buffer presentable whatever the callback did
        let closed = close(&*device, command_list.as_mut())
            .and_then(|()| device.submit_command_list(command_list.as_ref()));
        if let Err(err) = closed {
            return Err(abandon(&mut *device, recorded.err().unwrap_or(err)));
        }
        device.present()?;

        self.frames_rendered += 1;
        recorded.map(|()| true)
    }
}

const LOG_SOURCE: &str = "ember::RenderSystem";

fn record(
    device: &dyn GraphicsDevice,
    command_list: &mut dyn CommandList,
    callback: Option<&mut RenderCallback>,
) -> Result<()> {
    let Some(callback) = callback else {
        return Ok(());
    };
    let mut ctx = FrameContext {
        frame_index: device.current_frame_index(),
        back_buffer: device.current_back_buffer()?,
        depth_buffer: device.depth_buffer(),
        extent: device.swapchain_extent(),
        command_list,
    };
    callback(&mut ctx)
}

/// Close a rendering scope left open, move the back buffer to PresentSrc and end the list
fn close(device: &dyn GraphicsDevice, command_list: &mut dyn CommandList) -> Result<()> {
    // Fails when no scope is open
    let _ = command_list.end_rendering();
    let back_buffer = device.current_back_buffer()?;
    if back_buffer.layout(0, 0) != ImageLayout::PresentSrc {
        command_list.transition_image_layout(&back_buffer, ImageLayout::PresentSrc, SubresourceRange::single(0, 0))?;
    }
    command_list.end()
}

/// Release the open frame after `err`; returns `err`
fn abandon(device: &mut dyn GraphicsDevice, err: Error) -> Error {
    if err.is_fatal() {
        return err;
    }
    crate::engine_warn!(LOG_SOURCE, "Abandoning frame: {}", err);
    if let Err(abandon_err) = device.abandon_frame() {
        crate::engine_error!(LOG_SOURCE, "Frame could not be abandoned: {}", abandon_err);
    }
    err
}

#[cfg(test)]
#[path = "render_system_tests.rs"]
mod tests;
