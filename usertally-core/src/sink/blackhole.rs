use crate::error::Result;
use crate::message::WindowTally;
use crate::sink::Sink;

/// Blackhole is a sink to emulate /dev/null.
pub(crate) struct BlackholeSink;

impl Sink for BlackholeSink {
    async fn sink(&mut self, _tallies: Vec<WindowTally>) -> Result<()> {
        Ok(())
    }
}
