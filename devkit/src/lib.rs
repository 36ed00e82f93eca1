/*!
# Nimbus DevKit - Mocks et utilitaires de test

Bibliothèque facilitant les tests du moteur Nimbus avec:
- Bus mock (enregistre les publications, simule les messages entrants)
- Types cloud d'exemple (compteur, enregistreur, hook bloquant)
- Harness construisant un runtime complet sur des pools en mémoire
*/

pub mod fixtures;
pub mod mock_bus;
pub mod test_utils;

pub use fixtures::{fixture_catalog, fixture_code, Gate, GatedHook, Recorder};
pub use mock_bus::{MockBus, MockMessage};
pub use test_utils::TestHarness;
