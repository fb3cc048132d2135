/*!
Suite de développement pour le système d'outposts Hive

Permet de développer et tester le contrôleur et les agents sans plateforme
complète :
- `bus_stub` : serveur de bus en mémoire qui enregistre les enveloppes reçues
- `test_agent` : agent migrable minimal (snapshot/restore + messages différés)
*/

pub mod bus_stub;
pub mod test_agent;

pub use bus_stub::BusStub;
pub use test_agent::{TravelerAgent, TravelerState};
